//! Persisted record wrappers.
//!
//! The public domain types live in `flotilla-core`; these wrappers add the
//! bookkeeping columns the store needs (soft-delete markers, the current
//! release pointer, commit versions).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use flotilla_core::{App, Formation};

/// An app row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredApp {
    pub app: App,
    /// The app's current release, if one has been set.
    #[serde(default)]
    pub release_id: Option<String>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A formation row, live or tombstoned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FormationRecord {
    pub formation: Formation,
    /// Store-wide commit version, strictly increasing across all formation writes.
    pub version: u64,
    /// Set when the formation was deleted; the row stays behind as a tombstone.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl FormationRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// When this record last changed (its deletion time for tombstones).
    pub fn changed_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at.or(self.formation.updated_at)
    }
}
