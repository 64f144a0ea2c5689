//! Record handlers: apps, releases, artifacts, and formations.
//!
//! Formation writes go through the change feed so subscribers see them.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Map, Value};
use tracing::info;

use flotilla_core::{App, Artifact, Formation, Release};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

// ── Apps ───────────────────────────────────────────────────────

/// POST /apps
pub async fn create_app(
    State(state): State<ApiState>,
    Json(app): Json<App>,
) -> ApiResult<Json<App>> {
    let app = state.store.create_app(&app)?;
    info!(app_id = %app.id, name = %app.name, "app created");
    Ok(Json(app))
}

/// GET /apps
pub async fn list_apps(State(state): State<ApiState>) -> ApiResult<Json<Vec<App>>> {
    Ok(Json(state.store.list_apps()?))
}

/// GET /apps/{app}
pub async fn get_app(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> ApiResult<Json<App>> {
    state
        .store
        .get_app(&app)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("app not found: {app}")))
}

/// PATCH /apps/{app}
pub async fn update_app(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(patch): Json<Map<String, Value>>,
) -> ApiResult<Json<App>> {
    Ok(Json(state.store.update_app(&app, &patch)?))
}

/// DELETE /apps/{app}
pub async fn delete_app(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> ApiResult<StatusCode> {
    if state.store.delete_app(&app)? {
        info!(app = %app, "app deleted");
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::not_found(format!("app not found: {app}")))
    }
}

/// PUT /apps/{app}/release
///
/// Only the body's `id` is used.
pub async fn set_app_release(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(release): Json<Release>,
) -> ApiResult<StatusCode> {
    if release.id.is_empty() {
        return Err(ApiError::bad_request("missing release id"));
    }
    state.store.set_app_release(&app, &release.id)?;
    info!(app = %app, release_id = %release.id, "app release set");
    Ok(StatusCode::OK)
}

/// GET /apps/{app}/release
pub async fn get_app_release(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> ApiResult<Json<Release>> {
    state
        .store
        .get_app_release(&app)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("app {app} has no release")))
}

// ── Releases & artifacts ───────────────────────────────────────

/// POST /releases
pub async fn create_release(
    State(state): State<ApiState>,
    Json(release): Json<Release>,
) -> ApiResult<Json<Release>> {
    Ok(Json(state.store.create_release(&release)?))
}

/// GET /releases/{id}
pub async fn get_release(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Release>> {
    state
        .store
        .get_release(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("release not found: {id}")))
}

/// POST /artifacts
pub async fn create_artifact(
    State(state): State<ApiState>,
    Json(artifact): Json<Artifact>,
) -> ApiResult<Json<Artifact>> {
    Ok(Json(state.store.create_artifact(&artifact)?))
}

/// GET /artifacts/{id}
pub async fn get_artifact(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Artifact>> {
    state
        .store
        .get_artifact(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("artifact not found: {id}")))
}

// ── Formations ─────────────────────────────────────────────────

/// PUT /apps/{app}/formations/{release}
///
/// The path decides which formation is written; IDs in the body are ignored.
pub async fn put_formation(
    State(state): State<ApiState>,
    Path((app, release)): Path<(String, String)>,
    Json(mut formation): Json<Formation>,
) -> ApiResult<Json<Formation>> {
    formation.app_id = app;
    formation.release_id = release;
    Ok(Json(state.feed.put_formation(&formation)?))
}

/// GET /apps/{app}/formations/{release}
pub async fn get_formation(
    State(state): State<ApiState>,
    Path((app, release)): Path<(String, String)>,
) -> ApiResult<Json<Formation>> {
    state
        .store
        .get_formation(&app, &release)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("formation not found: {app}/{release}")))
}

/// DELETE /apps/{app}/formations/{release}
pub async fn delete_formation(
    State(state): State<ApiState>,
    Path((app, release)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    if state.feed.delete_formation(&app, &release)? {
        Ok(StatusCode::OK)
    } else {
        Err(ApiError::not_found(format!("formation not found: {app}/{release}")))
    }
}

/// GET /apps/{app}/formations
pub async fn list_formations(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> ApiResult<Json<Vec<Formation>>> {
    Ok(Json(state.store.list_formations(&app)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::test_state;

    fn artifact_and_release(state: &ApiState) -> Release {
        let artifact = state
            .store
            .create_artifact(&Artifact {
                kind: "docker".into(),
                uri: "docker://foo/bar".into(),
                ..Default::default()
            })
            .unwrap();
        state
            .store
            .create_release(&Release {
                artifact_id: artifact.id,
                ..Default::default()
            })
            .unwrap()
    }

    fn named(name: &str) -> App {
        App {
            name: name.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_and_get_app() {
        let state = test_state();
        let Json(app) = create_app(State(state.clone()), Json(named("billing")))
            .await
            .unwrap();
        assert_eq!(app.id.len(), 32);

        let Json(by_name) = get_app(State(state.clone()), Path("billing".into()))
            .await
            .unwrap();
        assert_eq!(by_name.id, app.id);

        let Json(by_id) = get_app(State(state), Path(app.id.clone())).await.unwrap();
        assert_eq!(by_id.name, "billing");
    }

    #[tokio::test]
    async fn invalid_app_name_is_bad_request() {
        let state = test_state();
        let err = create_app(State(state), Json(named("Not_Valid")))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.message(), "invalid app name");
    }

    #[tokio::test]
    async fn duplicate_app_name_conflicts() {
        let state = test_state();
        create_app(State(state.clone()), Json(named("dup"))).await.unwrap();
        let err = create_app(State(state), Json(named("dup"))).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn get_missing_app() {
        let state = test_state();
        let err = get_app(State(state), Path("nope".into())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn update_app_protected() {
        let state = test_state();
        state.store.create_app(&named("guarded")).unwrap();

        let patch: Map<String, Value> = serde_json::from_str(r#"{"protected": true}"#).unwrap();
        let Json(app) = update_app(State(state.clone()), Path("guarded".into()), Json(patch))
            .await
            .unwrap();
        assert!(app.protected);

        let patch: Map<String, Value> = serde_json::from_str(r#"{"protected": "yes"}"#).unwrap();
        let err = update_app(State(state), Path("guarded".into()), Json(patch))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_app_then_missing() {
        let state = test_state();
        state.store.create_app(&named("doomed")).unwrap();
        assert_eq!(
            delete_app(State(state.clone()), Path("doomed".into())).await.unwrap(),
            StatusCode::OK
        );
        let err = delete_app(State(state), Path("doomed".into())).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn app_release_round_trip() {
        let state = test_state();
        state.store.create_app(&named("released")).unwrap();
        let release = artifact_and_release(&state);

        let err = get_app_release(State(state.clone()), Path("released".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        set_app_release(
            State(state.clone()),
            Path("released".into()),
            Json(Release {
                id: release.id.clone(),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        let Json(current) = get_app_release(State(state), Path("released".into()))
            .await
            .unwrap();
        assert_eq!(current.id, release.id);
    }

    #[tokio::test]
    async fn release_requires_existing_artifact() {
        let state = test_state();
        let err = create_release(
            State(state),
            Json(Release {
                artifact_id: "missing".into(),
                ..Default::default()
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn formation_lifecycle() {
        let state = test_state();
        let app = state.store.create_app(&named("scaled")).unwrap();
        let release = artifact_and_release(&state);
        let path = || Path((app.name.clone(), release.id.clone()));

        let Json(stored) = put_formation(
            State(state.clone()),
            path(),
            Json(Formation {
                processes: HashMap::from([("web".to_string(), 2)]),
                ..Default::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(stored.app_id, app.id);
        assert_eq!(stored.processes["web"], 2);

        let Json(fetched) = get_formation(State(state.clone()), path()).await.unwrap();
        assert_eq!(fetched.processes, stored.processes);

        let Json(listed) = list_formations(State(state.clone()), Path(app.id.clone()))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        delete_formation(State(state.clone()), path()).await.unwrap();
        let err = get_formation(State(state.clone()), path()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        let err = delete_formation(State(state), path()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn formation_for_unknown_release() {
        let state = test_state();
        state.store.create_app(&named("scaled")).unwrap();
        let err = put_formation(
            State(state),
            Path(("scaled".into(), "missing".into())),
            Json(Formation::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
