//! redb table definitions for the Flotilla state store.
//!
//! Record tables use `&str` keys and `&[u8]` values (JSON-serialized).
//! Formations are keyed by the composite `{app_id}/{release_id}`.

use redb::TableDefinition;

/// App records keyed by clean app ID.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// Live app name → app ID index. Soft-deleted apps are removed from it.
pub const APP_NAMES: TableDefinition<&str, &str> = TableDefinition::new("app_names");

/// Releases keyed by release ID.
pub const RELEASES: TableDefinition<&str, &[u8]> = TableDefinition::new("releases");

/// Artifacts keyed by artifact ID.
pub const ARTIFACTS: TableDefinition<&str, &[u8]> = TableDefinition::new("artifacts");

/// Formation records (including deletion tombstones) keyed by `{app_id}/{release_id}`.
pub const FORMATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("formations");

/// Monotonic counters, e.g. the formation commit version.
pub const SEQUENCES: TableDefinition<&str, u64> = TableDefinition::new("sequences");

/// Key in [`SEQUENCES`] for the formation commit version.
pub const FORMATION_VERSION: &str = "formations";
