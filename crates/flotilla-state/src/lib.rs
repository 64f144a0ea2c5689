//! flotilla-state: durable controller state.
//!
//! Apps, releases, artifacts and formations are persisted in a single
//! redb database. Formation writes are stamped with a store-wide commit
//! version that the change feed uses for ordering and deduplication.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
