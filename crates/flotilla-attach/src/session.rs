//! AttachSession: a live byte channel between a client and a job.
//!
//! A session moves through `Requested → Connected → Streaming → Closed`,
//! or to `Failed` from any state. While streaming, input and output are
//! forwarded by two independent tasks so a stalled direction never blocks
//! the other. Output ending (the host closed its side) ends the session;
//! the client half-closing its write side only ends input.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use flotilla_cluster::{AttachIo, HostJobClient, TerminalControl};
use flotilla_core::{AttachFlags, AttachRequest};

use crate::error::{AttachError, AttachResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachState {
    Requested,
    Connected,
    Streaming,
    Closed,
    Failed,
}

/// Byte counts for a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

pub struct AttachSession {
    host_id: String,
    request: AttachRequest,
    state: watch::Sender<AttachState>,
    io: Option<Box<dyn AttachIo>>,
    control: Option<Arc<dyn TerminalControl>>,
}

impl std::fmt::Debug for AttachSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachSession")
            .field("host_id", &self.host_id)
            .field("request", &self.request)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

fn validate(request: &AttachRequest) -> AttachResult<()> {
    if request.job_id.is_empty() {
        return Err(AttachError::InvalidRequest("missing job id".to_string()));
    }
    let streams = AttachFlags::STDOUT.bits() | AttachFlags::STDERR.bits() | AttachFlags::STDIN.bits();
    if request.flags.bits() & streams == 0 {
        return Err(AttachError::InvalidRequest(
            "at least one of stdin, stdout, stderr is required".to_string(),
        ));
    }
    let interactive = request.flags.contains(AttachFlags::STREAM);
    if !interactive && (request.width != 0 || request.height != 0) {
        return Err(AttachError::InvalidRequest(
            "terminal size requires an interactive stream".to_string(),
        ));
    }
    Ok(())
}

impl AttachSession {
    /// Validate `request` and attach to the job on `host`.
    ///
    /// With `wait`, the host holds the attach until the job can take I/O.
    pub async fn open(
        host: &dyn HostJobClient,
        request: AttachRequest,
        wait: bool,
    ) -> AttachResult<Self> {
        let (state, _) = watch::channel(AttachState::Requested);
        validate(&request)?;

        let handle = match host.attach(&request, wait).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(host = %host.host_id(), job_id = %request.job_id, error = %e, "attach failed");
                return Err(e.into());
            }
        };
        state.send_replace(AttachState::Connected);
        debug!(host = %host.host_id(), job_id = %request.job_id, flags = ?request.flags, "attach connected");

        Ok(Self {
            host_id: host.host_id().to_string(),
            request,
            state,
            io: Some(handle.io),
            control: handle.control,
        })
    }

    pub fn state(&self) -> AttachState {
        *self.state.borrow()
    }

    /// Observe state transitions, including after [`run`](Self::run) consumes the session.
    pub fn watch_state(&self) -> watch::Receiver<AttachState> {
        self.state.subscribe()
    }

    pub fn request(&self) -> &AttachRequest {
        &self.request
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Forward a terminal resize to the host.
    pub async fn resize(&self, width: u16, height: u16) -> AttachResult<()> {
        let control = self.control.as_ref().ok_or_else(|| {
            AttachError::InvalidState("session has no terminal control".to_string())
        })?;
        match self.state() {
            AttachState::Connected | AttachState::Streaming => {}
            other => {
                return Err(AttachError::InvalidState(format!(
                    "cannot resize a {other:?} session"
                )));
            }
        }
        control.resize(width, height).await?;
        debug!(job_id = %self.request.job_id, width, height, "terminal resized");
        Ok(())
    }

    /// Hand over the job's byte stream for one-way reading (log retrieval).
    pub fn into_output(mut self) -> AttachResult<Box<dyn AttachIo>> {
        let io = self
            .io
            .take()
            .ok_or_else(|| AttachError::InvalidState("session already consumed".to_string()))?;
        self.state.send_replace(AttachState::Streaming);
        Ok(io)
    }

    /// Splice the job's I/O with `client` until output ends.
    ///
    /// Client bytes go to the job's stdin (when the attach includes stdin);
    /// job output goes to the client.
    pub async fn run<C>(mut self, client: C) -> AttachResult<AttachStats>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let io = self
            .io
            .take()
            .ok_or_else(|| AttachError::InvalidState("session already consumed".to_string()))?;
        self.state.send_replace(AttachState::Streaming);

        let (mut host_read, mut host_write) = tokio::io::split(io);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let input = self.request.flags.contains(AttachFlags::STDIN).then(|| {
            tokio::spawn(async move {
                let n = tokio::io::copy(&mut client_read, &mut host_write).await?;
                // Propagate the client's half-close as EOF on stdin.
                host_write.shutdown().await?;
                Ok::<u64, std::io::Error>(n)
            })
        });
        let output = tokio::spawn(async move {
            let n = tokio::io::copy(&mut host_read, &mut client_write).await?;
            client_write.shutdown().await?;
            Ok::<u64, std::io::Error>(n)
        });

        let output_result = output.await;

        let mut stats = AttachStats::default();
        let mut failure: Option<AttachError> = None;
        match output_result {
            Ok(Ok(n)) => stats.bytes_out = n,
            Ok(Err(e)) => failure = Some(e.into()),
            Err(e) => failure = Some(AttachError::InvalidState(format!("output task failed: {e}"))),
        }

        if let Some(input) = input {
            if input.is_finished() {
                match input.await {
                    Ok(Ok(n)) => stats.bytes_in = n,
                    Ok(Err(e)) => debug!(job_id = %self.request.job_id, error = %e, "input forwarding ended with error"),
                    Err(e) => debug!(job_id = %self.request.job_id, error = %e, "input task failed"),
                }
            } else {
                // Output is done; nothing left to deliver stdin to.
                input.abort();
            }
        }

        match failure {
            Some(e) => {
                self.state.send_replace(AttachState::Failed);
                warn!(host = %self.host_id, job_id = %self.request.job_id, error = %e, "attach session failed");
                Err(e)
            }
            None => {
                self.state.send_replace(AttachState::Closed);
                info!(
                    host = %self.host_id,
                    job_id = %self.request.job_id,
                    bytes_in = stats.bytes_in,
                    bytes_out = stats.bytes_out,
                    "attach session closed"
                );
                Ok(stats)
            }
        }
    }
}

impl Drop for AttachSession {
    fn drop(&mut self) {
        if self.io.is_some() {
            self.state.send_replace(AttachState::Closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_cluster::{ClusterError, MemoryCluster, MemoryHost};
    use tokio::io::AsyncReadExt;

    fn request(flags: AttachFlags) -> AttachRequest {
        AttachRequest {
            job_id: "job0".into(),
            flags,
            width: 0,
            height: 0,
        }
    }

    fn interactive() -> AttachRequest {
        AttachRequest {
            job_id: "job0".into(),
            flags: AttachFlags::STDIN | AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::STREAM,
            width: 80,
            height: 24,
        }
    }

    fn echo_host() -> Arc<MemoryHost> {
        let host = MemoryCluster::new().add_host("host0");
        host.set_attach_handler(|_, pipe| {
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(pipe);
                let mut buf = [0u8; 7];
                read.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"test in");
                write.write_all(b"test out").await.unwrap();
                write.shutdown().await.unwrap();
            });
        });
        host
    }

    #[tokio::test]
    async fn rejects_invalid_requests() {
        let host = echo_host();
        let err = AttachSession::open(host.as_ref(), request(AttachFlags::STREAM), true)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::InvalidRequest(_)));

        let mut sized = request(AttachFlags::STDOUT);
        sized.width = 80;
        let err = AttachSession::open(host.as_ref(), sized, true).await.unwrap_err();
        assert!(matches!(err, AttachError::InvalidRequest(_)));
        assert!(host.attaches().is_empty());
    }

    #[tokio::test]
    async fn host_error_surfaces() {
        let host = MemoryCluster::new().add_host("host0");
        let err = AttachSession::open(host.as_ref(), request(AttachFlags::STDOUT), false)
            .await
            .unwrap_err();
        assert!(matches!(err, AttachError::Cluster(ClusterError::JobNotFound(_))));
    }

    #[tokio::test]
    async fn duplex_session_runs_to_closed() {
        let host = echo_host();
        let session = AttachSession::open(host.as_ref(), interactive(), true)
            .await
            .unwrap();
        assert_eq!(session.state(), AttachState::Connected);
        let mut states = session.watch_state();

        let (client, mut remote) = tokio::io::duplex(1024);
        let run = tokio::spawn(session.run(client));

        remote.write_all(b"test in").await.unwrap();
        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"test out");

        let stats = run.await.unwrap().unwrap();
        assert_eq!(stats.bytes_out, 8);
        assert_eq!(*states.borrow_and_update(), AttachState::Closed);
    }

    #[tokio::test]
    async fn output_only_session_ignores_client_input() {
        let host = MemoryCluster::new().add_host("host0");
        host.set_output("job0", &b"log line\n"[..]);
        let session = AttachSession::open(
            host.as_ref(),
            request(AttachFlags::STDOUT | AttachFlags::STDERR),
            false,
        )
        .await
        .unwrap();

        let (client, mut remote) = tokio::io::duplex(1024);
        let stats = session.run(client).await.unwrap();
        assert_eq!(stats.bytes_out, 9);
        assert_eq!(stats.bytes_in, 0);

        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"log line\n");
    }

    #[tokio::test]
    async fn resize_forwards_to_host() {
        let host = echo_host();
        let session = AttachSession::open(host.as_ref(), interactive(), true)
            .await
            .unwrap();
        session.resize(132, 50).await.unwrap();
        assert_eq!(host.resizes(), vec![("job0".to_string(), 132, 50)]);
    }

    #[tokio::test]
    async fn resize_without_control_fails() {
        let host = MemoryCluster::new().add_host("host0");
        host.set_output("job0", &b""[..]);
        let session = AttachSession::open(host.as_ref(), request(AttachFlags::STDOUT), false)
            .await
            .unwrap();
        assert!(matches!(
            session.resize(80, 24).await,
            Err(AttachError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn into_output_reads_log() {
        let host = MemoryCluster::new().add_host("host0");
        host.set_output("job0", &b"foo"[..]);
        let session = AttachSession::open(host.as_ref(), request(AttachFlags::STDOUT), false)
            .await
            .unwrap();
        let mut io = session.into_output().unwrap();
        let mut out = Vec::new();
        io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"foo");
    }
}
