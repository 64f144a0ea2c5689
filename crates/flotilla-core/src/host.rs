//! Host-side wire types.
//!
//! A host is one cluster member running containerized jobs. These types
//! describe what the controller submits to a host, what a host reports
//! back about its active jobs, and how an attach to a job's I/O is
//! requested.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a host in the cluster.
pub type HostId = String;

/// A cluster member and the jobs it currently runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Host {
    pub id: HostId,
    #[serde(default)]
    pub jobs: Vec<HostJob>,
}

/// A job as submitted to (and reported by) a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HostJob {
    /// Host-local job ID. Left empty on submission; the host assigns one.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub config: ContainerConfig,
}

/// Container execution spec for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContainerConfig {
    /// Artifact URI to run.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    /// `KEY=value` pairs, sorted by key.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub attach_stdin: bool,
    #[serde(default)]
    pub attach_stdout: bool,
    #[serde(default)]
    pub attach_stderr: bool,
    #[serde(default)]
    pub open_stdin: bool,
    #[serde(default)]
    pub stdin_once: bool,
}

/// Lifecycle status of a job on its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Done,
    Crashed,
    Failed,
}

/// A job the host is tracking, with its runtime status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActiveJob {
    pub job: HostJob,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Job lifecycle event emitted by a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostEvent {
    pub job_id: String,
    pub kind: HostEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    Create,
    Start,
    Stop,
    Error,
}

// ── Attach ───────────────────────────────────────────────────────

/// Bit set selecting which streams an attach carries.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachFlags(u8);

impl AttachFlags {
    pub const STDOUT: AttachFlags = AttachFlags(1 << 0);
    pub const STDERR: AttachFlags = AttachFlags(1 << 1);
    pub const STDIN: AttachFlags = AttachFlags(1 << 2);
    /// Replay output produced before the attach.
    pub const LOGS: AttachFlags = AttachFlags(1 << 3);
    /// Keep the attach open as a live, interactive stream.
    pub const STREAM: AttachFlags = AttachFlags(1 << 4);

    pub const fn empty() -> Self {
        AttachFlags(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: AttachFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttachFlags {
    type Output = AttachFlags;

    fn bitor(self, rhs: AttachFlags) -> AttachFlags {
        AttachFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for AttachFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::STDOUT, "STDOUT"),
            (Self::STDERR, "STDERR"),
            (Self::STDIN, "STDIN"),
            (Self::LOGS, "LOGS"),
            (Self::STREAM, "STREAM"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "AttachFlags({})", set.join(" | "))
    }
}

/// Request to attach to a job's I/O on its host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachRequest {
    pub job_id: String,
    pub flags: AttachFlags,
    /// Terminal width; only meaningful for interactive attaches.
    #[serde(default)]
    pub width: u16,
    /// Terminal height; only meaningful for interactive attaches.
    #[serde(default)]
    pub height: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_combine_and_contain() {
        let flags = AttachFlags::STDOUT | AttachFlags::STDERR;
        assert!(flags.contains(AttachFlags::STDOUT));
        assert!(flags.contains(AttachFlags::STDERR));
        assert!(!flags.contains(AttachFlags::STDIN));
        assert!(AttachFlags::empty().contains(AttachFlags::empty()));
    }

    #[test]
    fn flags_serialize_as_integer() {
        let req = AttachRequest {
            job_id: "j1".into(),
            flags: AttachFlags::STDOUT | AttachFlags::STDIN,
            width: 0,
            height: 0,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["flags"], 5);
    }

    #[test]
    fn flags_debug_lists_names() {
        let flags = AttachFlags::STDERR | AttachFlags::STREAM;
        assert_eq!(format!("{flags:?}"), "AttachFlags(STDERR | STREAM)");
    }
}
