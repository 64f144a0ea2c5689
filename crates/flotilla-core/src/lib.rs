//! flotilla-core: shared types for the Flotilla controller.
//!
//! Controller records (apps, releases, artifacts, formations), the host
//! wire types exchanged with cluster members, identifier helpers, and the
//! `flotilla.toml` configuration format.

pub mod config;
pub mod host;
pub mod id;
pub mod types;

pub use config::ControllerConfig;
pub use host::*;
pub use id::{JobId, clean_uuid, is_id, new_id};
pub use types::*;
