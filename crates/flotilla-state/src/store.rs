//! StateStore: redb-backed persistence for the Flotilla controller.
//!
//! Provides typed operations over apps, releases, artifacts, and
//! formations. All values are JSON-serialized into redb's `&[u8]` value
//! columns. redb admits one write transaction at a time, so every
//! read-modify-write sequence below runs inside a single write transaction
//! and is linearized against concurrent writers (the equivalent of a
//! `SELECT ... FOR UPDATE` row lock).

use std::path::Path;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, Table};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use flotilla_core::{App, Artifact, Formation, Release, clean_uuid, formation_key, is_id, new_id};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

static APP_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z\d]+(-[a-z\d]+)*$").expect("valid app name pattern"));

const MAX_APP_NAME_LEN: usize = 30;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
        txn.open_table(RELEASES).map_err(map_err!(Table))?;
        txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
        txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Apps ───────────────────────────────────────────────────────

    /// Create an app. Generates an ID when none is given.
    pub fn create_app(&self, app: &App) -> StateResult<App> {
        validate_app_name(&app.name)?;

        let now = Utc::now();
        let mut app = app.clone();
        app.id = if app.id.is_empty() {
            new_id()
        } else {
            clean_uuid(&app.id)
        };
        app.created_at = Some(now);
        app.updated_at = Some(now);

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            if names.get(app.name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("app name {} is taken", app.name)));
            }
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            if apps.get(app.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("app {} already exists", app.id)));
            }
            let row = StoredApp {
                app: app.clone(),
                release_id: None,
                deleted_at: None,
            };
            put_json(&mut apps, &app.id, &row)?;
            names
                .insert(app.name.as_str(), app.id.as_str())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app_id = %app.id, name = %app.name, "app created");
        Ok(app)
    }

    /// Get a live app by ID or name.
    pub fn get_app(&self, id_or_name: &str) -> StateResult<Option<App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
        let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
        Ok(find_app(&apps, &names, id_or_name)?.map(|row| row.app))
    }

    /// List live apps, newest first.
    pub fn list_apps(&self) -> StateResult<Vec<App>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(APPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let row: StoredApp = decode(value.value())?;
            if row.deleted_at.is_none() {
                results.push(row.app);
            }
        }
        results.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(results)
    }

    /// Apply a partial update to an app.
    ///
    /// The only recognised key is `protected`, which must be a boolean.
    /// Unknown keys are ignored.
    pub fn update_app(
        &self,
        id_or_name: &str,
        patch: &serde_json::Map<String, serde_json::Value>,
    ) -> StateResult<App> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let app;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            let mut row = find_app(&apps, &names, id_or_name)?
                .ok_or_else(|| StateError::NotFound(format!("app {id_or_name}")))?;

            let mut changed = false;
            for (key, value) in patch {
                if key == "protected" {
                    let protected = value.as_bool().ok_or_else(|| StateError::TypeMismatch {
                        field: key.clone(),
                        expected: "bool",
                        found: json_type_name(value).to_string(),
                    })?;
                    if row.app.protected != protected {
                        row.app.protected = protected;
                        changed = true;
                    }
                }
            }

            if changed {
                row.app.updated_at = Some(Utc::now());
                put_json(&mut apps, &row.app.id.clone(), &row)?;
            }
            app = row.app;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(app)
    }

    /// Soft-delete an app. Returns true if a live app was deleted.
    pub fn delete_app(&self, id_or_name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let mut names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            match find_app(&apps, &names, id_or_name)? {
                Some(mut row) => {
                    row.deleted_at = Some(Utc::now());
                    put_json(&mut apps, &row.app.id.clone(), &row)?;
                    names
                        .remove(row.app.name.as_str())
                        .map_err(map_err!(Write))?;
                    existed = true;
                }
                None => existed = false,
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(app = %id_or_name, existed, "app deleted");
        Ok(existed)
    }

    /// Point an app at a release.
    pub fn set_app_release(&self, id_or_name: &str, release_id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            let releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            let mut row = find_app(&apps, &names, id_or_name)?
                .ok_or_else(|| StateError::NotFound(format!("app {id_or_name}")))?;
            let release_id = clean_uuid(release_id);
            if get_json::<Release, _>(&releases, &release_id)?.is_none() {
                return Err(StateError::NotFound(format!("release {release_id}")));
            }
            row.release_id = Some(release_id);
            row.app.updated_at = Some(Utc::now());
            put_json(&mut apps, &row.app.id.clone(), &row)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The app's current release, or `None` if it has not been set.
    pub fn get_app_release(&self, id_or_name: &str) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
        let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
        let row = find_app(&apps, &names, id_or_name)?
            .ok_or_else(|| StateError::NotFound(format!("app {id_or_name}")))?;
        match row.release_id {
            Some(release_id) => {
                let releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
                get_json(&releases, &release_id)
            }
            None => Ok(None),
        }
    }

    // ── Releases & artifacts ───────────────────────────────────────

    /// Create an immutable release. The referenced artifact must exist.
    pub fn create_release(&self, release: &Release) -> StateResult<Release> {
        if release.artifact_id.is_empty() {
            return Err(StateError::Validation(
                "release must reference an artifact".to_string(),
            ));
        }
        let mut release = release.clone();
        release.id = if release.id.is_empty() {
            new_id()
        } else {
            clean_uuid(&release.id)
        };
        release.artifact_id = clean_uuid(&release.artifact_id);
        release.created_at = Some(Utc::now());

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let artifacts = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
            if get_json::<Artifact, _>(&artifacts, &release.artifact_id)?.is_none() {
                return Err(StateError::NotFound(format!(
                    "artifact {}",
                    release.artifact_id
                )));
            }
            let mut releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            if releases.get(release.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!("release {} already exists", release.id)));
            }
            put_json(&mut releases, &release.id, &release)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(release_id = %release.id, "release created");
        Ok(release)
    }

    pub fn get_release(&self, id: &str) -> StateResult<Option<Release>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RELEASES).map_err(map_err!(Table))?;
        get_json(&table, &clean_uuid(id))
    }

    /// Create an immutable artifact.
    pub fn create_artifact(&self, artifact: &Artifact) -> StateResult<Artifact> {
        if artifact.uri.is_empty() {
            return Err(StateError::Validation("artifact uri must not be blank".to_string()));
        }
        let mut artifact = artifact.clone();
        artifact.id = if artifact.id.is_empty() {
            new_id()
        } else {
            clean_uuid(&artifact.id)
        };
        artifact.created_at = Some(Utc::now());

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
            if table.get(artifact.id.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::Conflict(format!(
                    "artifact {} already exists",
                    artifact.id
                )));
            }
            put_json(&mut table, &artifact.id, &artifact)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(artifact_id = %artifact.id, "artifact created");
        Ok(artifact)
    }

    pub fn get_artifact(&self, id: &str) -> StateResult<Option<Artifact>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ARTIFACTS).map_err(map_err!(Table))?;
        get_json(&table, &clean_uuid(id))
    }

    // ── Formations ─────────────────────────────────────────────────

    /// Insert or update a formation.
    ///
    /// The app may be given by ID or name; the stored formation always
    /// carries the app's ID. Each write is stamped with the next commit
    /// version.
    pub fn put_formation(&self, formation: &Formation) -> StateResult<FormationRecord> {
        if formation.app_id.is_empty() || formation.release_id.is_empty() {
            return Err(StateError::Validation(
                "missing app id and/or release id".to_string(),
            ));
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            let releases = txn.open_table(RELEASES).map_err(map_err!(Table))?;
            let app = find_app(&apps, &names, &formation.app_id)?
                .ok_or_else(|| StateError::NotFound(format!("app {}", formation.app_id)))?;
            let release_id = clean_uuid(&formation.release_id);
            if get_json::<Release, _>(&releases, &release_id)?.is_none() {
                return Err(StateError::NotFound(format!("release {release_id}")));
            }

            let mut formations = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
            let key = formation_key(&app.app.id, &release_id);
            let existing: Option<FormationRecord> = get_json(&formations, &key)?;

            let now = Utc::now();
            let created_at = existing
                .filter(|r| !r.is_deleted())
                .and_then(|r| r.formation.created_at)
                .unwrap_or(now);

            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            let version = next_version(&mut sequences)?;

            record = FormationRecord {
                formation: Formation {
                    app_id: app.app.id.clone(),
                    release_id,
                    processes: formation.processes.clone(),
                    created_at: Some(created_at),
                    updated_at: Some(now),
                },
                version,
                deleted_at: None,
            };
            put_json(&mut formations, &key, &record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %record.formation.key(), version = record.version, "formation stored");
        Ok(record)
    }

    /// Get a live formation.
    pub fn get_formation(&self, app: &str, release_id: &str) -> StateResult<Option<Formation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
        let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
        let Some(row) = find_app(&apps, &names, app)? else {
            return Ok(None);
        };
        let formations = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
        let key = formation_key(&row.app.id, &clean_uuid(release_id));
        let record: Option<FormationRecord> = get_json(&formations, &key)?;
        Ok(record.filter(|r| !r.is_deleted()).map(|r| r.formation))
    }

    /// List the live formations of an app.
    pub fn list_formations(&self, app: &str) -> StateResult<Vec<Formation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
        let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
        let row = find_app(&apps, &names, app)?
            .ok_or_else(|| StateError::NotFound(format!("app {app}")))?;

        let prefix = format!("{}/", row.app.id);
        let formations = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in formations.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: FormationRecord = decode(value.value())?;
                if !record.is_deleted() {
                    results.push(record.formation);
                }
            }
        }
        Ok(results)
    }

    /// Delete a formation, leaving a tombstone stamped with a new commit version.
    ///
    /// Returns the tombstone, or `None` if there was no live formation.
    pub fn delete_formation(
        &self,
        app: &str,
        release_id: &str,
    ) -> StateResult<Option<FormationRecord>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let tombstone;
        {
            let apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let names = txn.open_table(APP_NAMES).map_err(map_err!(Table))?;
            let row = find_app(&apps, &names, app)?
                .ok_or_else(|| StateError::NotFound(format!("app {app}")))?;

            let mut formations = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
            let key = formation_key(&row.app.id, &clean_uuid(release_id));
            let existing: Option<FormationRecord> = get_json(&formations, &key)?;
            let Some(mut record) = existing.filter(|r| !r.is_deleted()) else {
                return Ok(None);
            };

            let mut sequences = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            record.version = next_version(&mut sequences)?;
            record.deleted_at = Some(Utc::now());
            put_json(&mut formations, &key, &record)?;
            tombstone = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(key = %tombstone.formation.key(), version = tombstone.version, "formation deleted");
        Ok(Some(tombstone))
    }

    /// Every formation record (live or tombstoned) that changed at or after
    /// `since`, in commit order.
    pub fn formation_changes_since(&self, since: DateTime<Utc>) -> StateResult<Vec<FormationRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(FORMATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: FormationRecord = decode(value.value())?;
            if record.changed_at().is_some_and(|at| at >= since) {
                results.push(record);
            }
        }
        results.sort_by_key(|r| r.version);
        Ok(results)
    }
}

// ── Helpers ──────────────────────────────────────────────────────

fn validate_app_name(name: &str) -> StateResult<()> {
    if name.is_empty() {
        return Err(StateError::Validation("app name must not be blank".to_string()));
    }
    if name.len() > MAX_APP_NAME_LEN || !APP_NAME_PATTERN.is_match(name) {
        return Err(StateError::Validation("invalid app name".to_string()));
    }
    Ok(())
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn put_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Resolve a live app by ID (dashed or clean) or by name.
fn find_app<A, N>(apps: &A, names: &N, id_or_name: &str) -> StateResult<Option<StoredApp>>
where
    A: ReadableTable<&'static str, &'static [u8]>,
    N: ReadableTable<&'static str, &'static str>,
{
    if is_id(id_or_name) {
        let row: Option<StoredApp> = get_json(apps, &clean_uuid(id_or_name))?;
        if let Some(row) = row.filter(|r| r.deleted_at.is_none()) {
            return Ok(Some(row));
        }
    }
    let id = names
        .get(id_or_name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_string());
    match id {
        Some(id) => {
            let row: Option<StoredApp> = get_json(apps, &id)?;
            Ok(row.filter(|r| r.deleted_at.is_none()))
        }
        None => Ok(None),
    }
}

fn next_version(sequences: &mut Table<'_, &'static str, u64>) -> StateResult<u64> {
    let current = sequences
        .get(FORMATION_VERSION)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    sequences
        .insert(FORMATION_VERSION, next)
        .map_err(map_err!(Write))?;
    Ok(next)
}
