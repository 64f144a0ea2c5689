//! Cluster and host capability traits.
//!
//! [`ClusterView`] enumerates hosts and hands out a [`HostJobClient`] per
//! host. Both are object-safe so the controller can run against a real,
//! network-backed cluster or the in-memory double used in tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};

use flotilla_core::{ActiveJob, AttachRequest, Host, HostEvent, HostJob};

use crate::error::ClusterResult;

/// The set of hosts known to the controller.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Every reachable host together with the jobs it currently runs.
    async fn list_hosts(&self) -> ClusterResult<Vec<Host>>;

    /// A job-control handle for one host. Fails with `HostNotFound` for an
    /// unknown ID without contacting anything.
    async fn dial_host(&self, host_id: &str) -> ClusterResult<Arc<dyn HostJobClient>>;
}

/// Job-control capabilities of a single host.
#[async_trait]
pub trait HostJobClient: Send + Sync {
    fn host_id(&self) -> &str;

    async fn list_jobs(&self) -> ClusterResult<Vec<ActiveJob>>;

    async fn get_job(&self, job_id: &str) -> ClusterResult<ActiveJob>;

    /// Submit a job. Returns the host-assigned job ID.
    async fn add_job(&self, job: HostJob) -> ClusterResult<String>;

    /// Ask the host to stop a job. Success means the stop was accepted.
    async fn stop_job(&self, job_id: &str) -> ClusterResult<()>;

    /// Attach to a job's I/O. With `wait`, blocks until the job is ready
    /// to accept I/O.
    async fn attach(&self, req: &AttachRequest, wait: bool) -> ClusterResult<AttachHandle>;

    /// Lifecycle events for one job, or for all jobs when `job_id` is `None`.
    async fn stream_events(
        &self,
        job_id: Option<&str>,
    ) -> ClusterResult<BoxStream<'static, ClusterResult<HostEvent>>>;
}

/// A bidirectional byte channel to a job.
pub trait AttachIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AttachIo for T {}

/// Out-of-band control for an interactive attach.
#[async_trait]
pub trait TerminalControl: Send + Sync {
    async fn resize(&self, width: u16, height: u16) -> ClusterResult<()>;
}

/// What a host hands back for an accepted attach.
pub struct AttachHandle {
    pub io: Box<dyn AttachIo>,
    /// Present only for interactive (TTY) attaches.
    pub control: Option<Arc<dyn TerminalControl>>,
}

impl AttachHandle {
    pub fn new(io: impl AttachIo + 'static) -> Self {
        Self {
            io: Box::new(io),
            control: None,
        }
    }

    pub fn with_control(mut self, control: Arc<dyn TerminalControl>) -> Self {
        self.control = Some(control);
        self
    }
}

impl fmt::Debug for AttachHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachHandle")
            .field("control", &self.control.is_some())
            .finish_non_exhaustive()
    }
}
