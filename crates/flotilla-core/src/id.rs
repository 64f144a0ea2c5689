//! Identifier helpers.
//!
//! Record IDs are v4 UUIDs rendered in "clean" form (no dashes). Jobs are
//! addressed externally by a composite `<host_id>-<job_id>` string.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

static ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-f0-9]{8}-?([a-f0-9]{4}-?){3}[a-f0-9]{12}$").expect("valid id pattern")
});

/// Generate a fresh record ID in clean form.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Strip dashes from a UUID string.
pub fn clean_uuid(id: &str) -> String {
    id.replace('-', "")
}

/// Whether `s` looks like a UUID, dashed or clean.
pub fn is_id(s: &str) -> bool {
    ID_PATTERN.is_match(s)
}

/// Composite job address: host ID and host-local job ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId {
    pub host_id: String,
    pub job_id: String,
}

impl JobId {
    pub fn new(host_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            job_id: job_id.into(),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.host_id, self.job_id)
    }
}

/// Error returned when a composite job ID has no separator or an empty half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidJobId(pub String);

impl fmt::Display for InvalidJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid job id: {}", self.0)
    }
}

impl std::error::Error for InvalidJobId {}

impl FromStr for JobId {
    type Err = InvalidJobId;

    /// Splits at the first hyphen; host IDs never contain one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            Some((host, job)) if !host.is_empty() && !job.is_empty() => Ok(JobId::new(host, job)),
            _ => Err(InvalidJobId(s.to_string())),
        }
    }
}
