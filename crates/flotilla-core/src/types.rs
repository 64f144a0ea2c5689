//! Controller domain types shared across Flotilla crates.
//!
//! These are the records the controller persists (apps, releases,
//! artifacts, formations) and the transient request/response shapes
//! exchanged with API clients (new-job requests, job descriptors).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Attribute key tagging a host job with its owning app.
pub const ATTR_APP: &str = "flotilla.app";
/// Attribute key tagging a host job with the release it runs.
pub const ATTR_RELEASE: &str = "flotilla.release";
/// Attribute key tagging a host job with its process type.
pub const ATTR_TYPE: &str = "flotilla.type";

// ── App ──────────────────────────────────────────────────────────

/// An application registered with the controller.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct App {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub protected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

// ── Release / Artifact ──────────────────────────────────────────

/// Immutable pairing of an artifact with its runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Release {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "artifact")]
    pub artifact_id: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Named process types this release knows how to run.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub processes: HashMap<String, ProcessType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Command and environment for one named process type of a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProcessType {
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// A runnable image or binary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Artifact {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

// ── Formation ───────────────────────────────────────────────────

/// Desired process counts for one (app, release) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Formation {
    #[serde(default, rename = "app")]
    pub app_id: String,
    #[serde(default, rename = "release")]
    pub release_id: String,
    #[serde(default)]
    pub processes: HashMap<String, i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Formation {
    /// Composite `{app_id}/{release_id}` key.
    pub fn key(&self) -> String {
        formation_key(&self.app_id, &self.release_id)
    }
}

/// Build the composite key identifying a formation.
pub fn formation_key(app_id: &str, release_id: &str) -> String {
    format!("{app_id}/{release_id}")
}

/// A formation joined with its app, release, and artifact.
///
/// `processes == None` means the formation was deleted; an intentionally
/// empty formation carries `Some(empty map)`. The JSON form keeps the two
/// apart by omitting the key for deletions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpandedFormation {
    pub app: App,
    pub release: Release,
    pub artifact: Artifact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<HashMap<String, i32>>,
    pub updated_at: DateTime<Utc>,
}

impl ExpandedFormation {
    pub fn is_deletion(&self) -> bool {
        self.processes.is_none()
    }

    pub fn key(&self) -> String {
        formation_key(&self.app.id, &self.release.id)
    }
}

/// One item of a formation change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A formation was created, updated, or deleted.
    Formation(ExpandedFormation),
    /// The historical replay is exhausted; everything after this is live.
    ReplayComplete,
}

// ── Jobs ────────────────────────────────────────────────────────

/// Request to run a one-off or typed command from a release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewJob {
    #[serde(rename = "release")]
    pub release_id: String,
    /// Named process type; `None` for an ad-hoc command.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub process_type: Option<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub columns: u16,
    #[serde(default)]
    pub lines: u16,
}

/// Public view of a job running somewhere in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Job {
    /// Composite `<host_id>-<job_id>`.
    pub id: String,
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub process_type: String,
    #[serde(default, rename = "release", skip_serializing_if = "String::is_empty")]
    pub release_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,
}
