//! Dispatcher error types.

use thiserror::Error;

use flotilla_attach::AttachError;
use flotilla_cluster::ClusterError;
use flotilla_core::id::InvalidJobId;
use flotilla_state::StateError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("app not found: {0}")]
    AppNotFound(String),

    #[error("release not found: {0}")]
    ReleaseNotFound(String),

    #[error("artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("process type {process_type} not defined by release {release_id}")]
    ProcessTypeNotFound {
        release_id: String,
        process_type: String,
    },

    #[error("no host available to run the job")]
    NoEligibleHost,

    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    InvalidJobId(#[from] InvalidJobId),

    #[error("host rejected job: {0}")]
    Rejected(String),

    #[error("upstream failure: {0}")]
    Upstream(ClusterError),

    #[error("attach failed: {0}")]
    Attach(AttachError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

impl From<ClusterError> for DispatchError {
    fn from(e: ClusterError) -> Self {
        match e {
            ClusterError::HostNotFound(host) => Self::HostNotFound(host),
            ClusterError::JobNotFound(job) => Self::JobNotFound(job),
            ClusterError::Rejected(reason) => Self::Rejected(reason),
            other => Self::Upstream(other),
        }
    }
}

impl From<AttachError> for DispatchError {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::Cluster(e) => e.into(),
            other => Self::Attach(other),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
