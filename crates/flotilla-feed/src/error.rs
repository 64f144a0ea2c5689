//! Error types for the formation change feed.

use flotilla_state::StateError;
use thiserror::Error;

pub type FeedResult<T> = Result<T, FeedError>;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("formation feed is closed")]
    Closed,

    /// The subscriber's queue overflowed and it was disconnected.
    #[error("subscriber fell behind and was disconnected")]
    Lagged,

    #[error("state error: {0}")]
    State(#[from] StateError),
}
