//! Job handlers: list, run (detached or attached), kill, and log.
//!
//! An attached run answers `101 Switching Protocols` and then splices the
//! upgraded connection with the job's stdin/stdout/stderr until the job's
//! output ends.

use axum::Json;
use axum::body::{Body, to_bytes};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tracing::{debug, info, warn};

use flotilla_attach::{EVENT_STREAM, LogFormat, transcode};
use flotilla_cluster::ATTACH_PROTOCOL;
use flotilla_core::{Job, NewJob};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

/// Media type a client sends in `Accept` to run a job attached.
pub const ATTACH_MEDIA_TYPE: &str = "application/vnd.flynn.attach";

const MAX_JOB_REQUEST: usize = 1024 * 1024;

fn wants_attach(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|media| media.split(';').next().is_some_and(|m| m.trim() == ATTACH_MEDIA_TYPE))
}

/// GET /apps/{app}/jobs
pub async fn list_jobs(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> ApiResult<Json<Vec<Job>>> {
    Ok(Json(state.dispatcher.list_jobs(&app).await?))
}

/// POST /apps/{app}/jobs
pub async fn run_job(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    req: Request,
) -> ApiResult<Response> {
    let attach = wants_attach(req.headers());
    let (mut parts, body) = req.into_parts();
    let body = to_bytes(body, MAX_JOB_REQUEST)
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read job request: {e}")))?;
    let new_job: NewJob = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("invalid job request: {e}")))?;

    if !attach {
        let (job, _) = state.dispatcher.run(&app, &new_job, false).await?;
        return Ok(Json(job).into_response());
    }

    // Checked before dispatching so a plain request never leaves a job behind.
    let on_upgrade = parts
        .extensions
        .remove::<OnUpgrade>()
        .ok_or_else(|| ApiError::bad_request("attached run requires a connection upgrade"))?;

    let (job, session) = state.dispatcher.run(&app, &new_job, true).await?;
    let session = session.ok_or_else(|| {
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "attach session missing")
    })?;

    let job_id = job.id.clone();
    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                warn!(%job_id, error = %e, "client upgrade failed");
                return;
            }
        };
        if let Err(e) = session.run(TokioIo::new(upgraded)).await {
            warn!(%job_id, error = %e, "attached run ended with error");
        }
    });

    debug!(app = %app, job_id = %job.id, "upgrading to attach stream");
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, ATTACH_PROTOCOL)
        .header(header::CONTENT_TYPE, ATTACH_MEDIA_TYPE)
        .body(Body::empty())
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// DELETE /apps/{app}/jobs/{job}
pub async fn kill_job(
    State(state): State<ApiState>,
    Path((app, job)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state.dispatcher.kill(&app, &job).await?;
    info!(app = %app, job_id = %job, "job killed");
    Ok(StatusCode::OK)
}

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub follow: bool,
}

/// GET /apps/{app}/jobs/{job}/log
///
/// Raw output by default; `Accept: text/event-stream` gets one event per
/// frame. Once headers are out, a failure can only cut the body short.
pub async fn job_log(
    State(state): State<ApiState>,
    Path((app, job)): Path<(String, String)>,
    Query(params): Query<LogParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let accept = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok());
    let format = LogFormat::negotiate(accept);

    let session = state.dispatcher.open_log(&app, &job, params.follow).await?;
    let output = session
        .into_output()
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let job_id = job.clone();
    let stream = transcode(output, format).inspect(move |item| {
        if let Err(e) = item {
            warn!(job_id = %job_id, error = %e, "log stream aborted");
        }
    });

    let content_type = match format {
        LogFormat::EventStream => EVENT_STREAM,
        LogFormat::Raw => "application/octet-stream",
    };
    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn attach_accept_detection() {
        let mut headers = HeaderMap::new();
        assert!(!wants_attach(&headers));

        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        assert!(!wants_attach(&headers));

        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, application/vnd.flynn.attach"),
        );
        assert!(wants_attach(&headers));
    }
}
