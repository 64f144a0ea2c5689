//! flotilla-api: HTTP API for the Flotilla controller.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/apps` | List apps |
//! | POST | `/apps` | Create an app |
//! | GET | `/apps/{app}` | Get an app by ID or name |
//! | PATCH | `/apps/{app}` | Update an app (`protected`) |
//! | DELETE | `/apps/{app}` | Delete an app |
//! | GET | `/apps/{app}/release` | Current release |
//! | PUT | `/apps/{app}/release` | Set the current release |
//! | GET | `/apps/{app}/formations` | List formations |
//! | GET | `/apps/{app}/formations/{release}` | Get a formation |
//! | PUT | `/apps/{app}/formations/{release}` | Upsert a formation |
//! | DELETE | `/apps/{app}/formations/{release}` | Delete a formation |
//! | GET | `/apps/{app}/jobs` | Jobs across all hosts |
//! | POST | `/apps/{app}/jobs` | Run a job, attached with `Accept: application/vnd.flynn.attach` |
//! | DELETE | `/apps/{app}/jobs/{job}` | Stop a job |
//! | GET | `/apps/{app}/jobs/{job}/log` | Job output, raw or `text/event-stream` |
//! | POST | `/releases` | Create a release |
//! | GET | `/releases/{id}` | Get a release |
//! | POST | `/artifacts` | Create an artifact |
//! | GET | `/artifacts/{id}` | Get an artifact |
//! | GET | `/formations?since=` | Formation change stream (SSE) |

pub mod error;
pub mod handlers;
pub mod jobs;
pub mod stream;

use axum::Router;
use axum::routing::{delete, get, post};

use flotilla_dispatch::JobDispatcher;
use flotilla_feed::FormationFeed;
use flotilla_state::StateStore;

pub use error::{ApiError, ApiResult};
pub use jobs::ATTACH_MEDIA_TYPE;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub feed: FormationFeed,
    pub dispatcher: JobDispatcher,
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/apps", get(handlers::list_apps).post(handlers::create_app))
        .route(
            "/apps/{app}",
            get(handlers::get_app)
                .patch(handlers::update_app)
                .delete(handlers::delete_app),
        )
        .route(
            "/apps/{app}/release",
            get(handlers::get_app_release).put(handlers::set_app_release),
        )
        .route("/apps/{app}/formations", get(handlers::list_formations))
        .route(
            "/apps/{app}/formations/{release}",
            get(handlers::get_formation)
                .put(handlers::put_formation)
                .delete(handlers::delete_formation),
        )
        .route("/apps/{app}/jobs", get(jobs::list_jobs).post(jobs::run_job))
        .route("/apps/{app}/jobs/{job}", delete(jobs::kill_job))
        .route("/apps/{app}/jobs/{job}/log", get(jobs::job_log))
        .route("/releases", post(handlers::create_release))
        .route("/releases/{id}", get(handlers::get_release))
        .route("/artifacts", post(handlers::create_artifact))
        .route("/artifacts/{id}", get(handlers::get_artifact))
        .route("/formations", get(stream::stream_formations))
        .with_state(state)
}

#[cfg(test)]
pub(crate) fn test_state() -> ApiState {
    use std::sync::Arc;

    use flotilla_cluster::{ClusterView, MemoryCluster};

    let store = StateStore::open_in_memory().unwrap();
    let feed = FormationFeed::new(store.clone(), 16);
    let cluster: Arc<dyn ClusterView> = Arc::new(MemoryCluster::new());
    ApiState {
        dispatcher: JobDispatcher::new(store.clone(), cluster),
        feed,
        store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn create_app_over_router() {
        let router = build_router(test_state());
        let resp = router
            .clone()
            .oneshot(
                Request::post("/apps")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"routed"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router
            .oneshot(Request::get("/apps/routed").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let app: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(app["name"], "routed");
    }

    #[tokio::test]
    async fn errors_have_json_body() {
        let router = build_router(test_state());
        let resp = router
            .oneshot(Request::get("/apps/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let err: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(err["error"], "app not found: missing");
    }
}
