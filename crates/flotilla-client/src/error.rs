//! Client error types.

use thiserror::Error;

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Rejected before any request was sent.
    #[error("{0}")]
    Validation(String),

    #[error("{method} {url}: unexpected status {status}")]
    UnexpectedStatus {
        method: String,
        url: String,
        status: u16,
    },

    #[error("http error: {0}")]
    Http(String),

    #[error("decode error: {0}")]
    Decode(String),
}
