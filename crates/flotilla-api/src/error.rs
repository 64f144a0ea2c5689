//! Mapping of domain errors onto HTTP responses.
//!
//! Every error body has the shape `{"error": "<message>"}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use flotilla_dispatch::DispatchError;
use flotilla_feed::FeedError;
use flotilla_state::StateError;

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// An error ready to be sent to the client.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn state_status(e: &StateError) -> StatusCode {
    match e {
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::Validation(_) | StateError::TypeMismatch { .. } => StatusCode::BAD_REQUEST,
        StateError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        Self::new(state_status(&e), e.to_string())
    }
}

impl From<FeedError> for ApiError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::State(e) => e.into(),
            FeedError::Closed => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            FeedError::Lagged => Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::AppNotFound(_)
            | DispatchError::ReleaseNotFound(_)
            | DispatchError::ArtifactNotFound(_)
            | DispatchError::ProcessTypeNotFound { .. }
            | DispatchError::HostNotFound(_)
            | DispatchError::JobNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::InvalidJobId(_) => StatusCode::BAD_REQUEST,
            DispatchError::NoEligibleHost => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::Rejected(_) | DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
            DispatchError::State(inner) => state_status(inner),
            DispatchError::Attach(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}
