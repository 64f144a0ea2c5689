//! Error types for log frames and attach sessions.

use std::io;

use thiserror::Error;

use flotilla_cluster::ClusterError;

pub type FrameResult<T> = Result<T, FrameError>;
pub type AttachResult<T> = Result<T, AttachError>;

/// A malformed multiplexed log stream.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid stream tag {0}")]
    InvalidStream(u8),

    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("truncated frame: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },

    #[error("encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("invalid attach request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid session state: {0}")]
    InvalidState(String),
}
