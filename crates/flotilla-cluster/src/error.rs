//! Error types for cluster and host operations.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("unexpected status {status} from {method} {url}")]
    UnexpectedStatus {
        method: String,
        url: String,
        status: u16,
    },

    #[error("transport error talking to {host}: {message}")]
    Transport { host: String, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    /// The host refused the request (bad job spec, capacity, unsupported attach).
    #[error("host rejected request: {0}")]
    Rejected(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::HostNotFound(_) | Self::JobNotFound(_))
    }
}
