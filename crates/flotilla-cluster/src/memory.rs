//! In-memory cluster for tests and local development.
//!
//! Hosts keep their jobs in memory and record every stop, attach, and
//! resize so callers can assert on what the controller asked for.
//! Attaches are served over an in-process duplex pipe; the far end is
//! handed to an attach handler (or fed from canned job output).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use flotilla_core::{
    ActiveJob, AttachFlags, AttachRequest, Host, HostEvent, HostEventKind, HostJob, JobStatus,
};

use crate::client::{AttachHandle, ClusterView, HostJobClient, TerminalControl};
use crate::error::{ClusterError, ClusterResult};

const PIPE_CAPACITY: usize = 64 * 1024;

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Called with the host side of every attach pipe.
pub type AttachHandler = Arc<dyn Fn(AttachRequest, DuplexStream) + Send + Sync>;

/// A cluster of [`MemoryHost`]s, listed in ascending ID order.
#[derive(Default, Clone)]
pub struct MemoryCluster {
    hosts: Arc<Mutex<BTreeMap<String, Arc<MemoryHost>>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a host and return it.
    pub fn add_host(&self, id: &str) -> Arc<MemoryHost> {
        let host = Arc::new(MemoryHost::new(id));
        locked(&self.hosts).insert(id.to_string(), host.clone());
        host
    }

    pub fn remove_host(&self, id: &str) -> Option<Arc<MemoryHost>> {
        locked(&self.hosts).remove(id)
    }

    pub fn host(&self, id: &str) -> Option<Arc<MemoryHost>> {
        locked(&self.hosts).get(id).cloned()
    }
}

#[async_trait]
impl ClusterView for MemoryCluster {
    async fn list_hosts(&self) -> ClusterResult<Vec<Host>> {
        let hosts: Vec<Arc<MemoryHost>> = locked(&self.hosts).values().cloned().collect();
        Ok(hosts
            .iter()
            .map(|host| Host {
                id: host.id.clone(),
                jobs: locked(&host.jobs).iter().map(|a| a.job.clone()).collect(),
            })
            .collect())
    }

    async fn dial_host(&self, host_id: &str) -> ClusterResult<Arc<dyn HostJobClient>> {
        match self.host(host_id) {
            Some(host) => Ok(host as Arc<dyn HostJobClient>),
            None => Err(ClusterError::HostNotFound(host_id.to_string())),
        }
    }
}

/// One in-memory host.
pub struct MemoryHost {
    id: String,
    jobs: Mutex<Vec<ActiveJob>>,
    next_job: AtomicU64,
    stopped: Mutex<Vec<String>>,
    attaches: Mutex<Vec<(AttachRequest, bool)>>,
    resizes: Arc<Mutex<Vec<(String, u16, u16)>>>,
    output: Mutex<HashMap<String, Bytes>>,
    attach_handler: Mutex<Option<AttachHandler>>,
    rejection: Mutex<Option<String>>,
    events: broadcast::Sender<HostEvent>,
}

impl MemoryHost {
    fn new(id: &str) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            id: id.to_string(),
            jobs: Mutex::new(Vec::new()),
            next_job: AtomicU64::new(0),
            stopped: Mutex::new(Vec::new()),
            attaches: Mutex::new(Vec::new()),
            resizes: Arc::new(Mutex::new(Vec::new())),
            output: Mutex::new(HashMap::new()),
            attach_handler: Mutex::new(None),
            rejection: Mutex::new(None),
            events,
        }
    }

    /// Seed a running job without going through `add_job`.
    pub fn insert_job(&self, job: HostJob) {
        locked(&self.jobs).push(ActiveJob {
            job,
            status: JobStatus::Running,
            started_at: Some(Utc::now()),
        });
    }

    /// Jobs currently on this host, in submission order.
    pub fn jobs(&self) -> Vec<HostJob> {
        locked(&self.jobs).iter().map(|a| a.job.clone()).collect()
    }

    /// Job IDs passed to `stop_job`, in call order.
    pub fn stopped(&self) -> Vec<String> {
        locked(&self.stopped).clone()
    }

    /// Attach requests received, with their `wait` flag.
    pub fn attaches(&self) -> Vec<(AttachRequest, bool)> {
        locked(&self.attaches).clone()
    }

    /// Resize calls received as `(job_id, width, height)`.
    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        locked(&self.resizes).clone()
    }

    /// Bytes written to any attach of `job_id` that has no attach handler.
    pub fn set_output(&self, job_id: &str, output: impl Into<Bytes>) {
        locked(&self.output).insert(job_id.to_string(), output.into());
    }

    pub fn set_attach_handler(
        &self,
        handler: impl Fn(AttachRequest, DuplexStream) + Send + Sync + 'static,
    ) {
        *locked(&self.attach_handler) = Some(Arc::new(handler));
    }

    /// Make subsequent `add_job` calls fail with `Rejected(reason)`.
    pub fn reject_jobs(&self, reason: &str) {
        *locked(&self.rejection) = Some(reason.to_string());
    }

    /// Publish a lifecycle event to `stream_events` subscribers.
    pub fn emit(&self, job_id: &str, kind: HostEventKind) {
        // No receivers is fine.
        let _ = self.events.send(HostEvent {
            job_id: job_id.to_string(),
            kind,
        });
    }

    fn has_job(&self, job_id: &str) -> bool {
        locked(&self.jobs).iter().any(|a| a.job.id == job_id)
    }
}

#[async_trait]
impl HostJobClient for MemoryHost {
    fn host_id(&self) -> &str {
        &self.id
    }

    async fn list_jobs(&self) -> ClusterResult<Vec<ActiveJob>> {
        Ok(locked(&self.jobs).clone())
    }

    async fn get_job(&self, job_id: &str) -> ClusterResult<ActiveJob> {
        locked(&self.jobs)
            .iter()
            .find(|a| a.job.id == job_id)
            .cloned()
            .ok_or_else(|| ClusterError::JobNotFound(format!("{}-{}", self.id, job_id)))
    }

    async fn add_job(&self, mut job: HostJob) -> ClusterResult<String> {
        if let Some(reason) = locked(&self.rejection).clone() {
            return Err(ClusterError::Rejected(reason));
        }
        if job.id.is_empty() {
            job.id = format!("job{}", self.next_job.fetch_add(1, Ordering::Relaxed));
        }
        let id = job.id.clone();
        self.insert_job(job);
        self.emit(&id, HostEventKind::Create);
        debug!(host = %self.id, job_id = %id, "memory host accepted job");
        Ok(id)
    }

    async fn stop_job(&self, job_id: &str) -> ClusterResult<()> {
        locked(&self.stopped).push(job_id.to_string());
        let removed = {
            let mut jobs = locked(&self.jobs);
            let before = jobs.len();
            jobs.retain(|a| a.job.id != job_id);
            before != jobs.len()
        };
        if removed {
            self.emit(job_id, HostEventKind::Stop);
        }
        Ok(())
    }

    async fn attach(&self, req: &AttachRequest, wait: bool) -> ClusterResult<AttachHandle> {
        locked(&self.attaches).push((req.clone(), wait));

        let handler = locked(&self.attach_handler).clone();
        let output = locked(&self.output).get(&req.job_id).cloned();
        if handler.is_none() && output.is_none() && !self.has_job(&req.job_id) {
            return Err(ClusterError::JobNotFound(format!("{}-{}", self.id, req.job_id)));
        }

        let (client_end, host_end) = tokio::io::duplex(PIPE_CAPACITY);
        match (handler, output) {
            (Some(handler), _) => handler(req.clone(), host_end),
            (None, Some(output)) => {
                tokio::spawn(async move {
                    let mut host_end = host_end;
                    if host_end.write_all(&output).await.is_ok() {
                        let _ = host_end.shutdown().await;
                    }
                });
            }
            // Hold the pipe open until the client goes away.
            (None, None) => {
                tokio::spawn(async move {
                    let mut host_end = host_end;
                    let _ = tokio::io::copy(&mut host_end, &mut tokio::io::sink()).await;
                });
            }
        }

        let mut handle = AttachHandle::new(client_end);
        if req.flags.contains(AttachFlags::STDIN) {
            handle = handle.with_control(Arc::new(MemoryTerminalControl {
                job_id: req.job_id.clone(),
                resizes: self.resizes.clone(),
            }));
        }
        Ok(handle)
    }

    async fn stream_events(
        &self,
        job_id: Option<&str>,
    ) -> ClusterResult<BoxStream<'static, ClusterResult<HostEvent>>> {
        let filter = job_id.map(str::to_string);
        let events = BroadcastStream::new(self.events.subscribe()).filter_map(move |event| {
            let item = match event {
                Ok(event) if filter.as_ref().is_none_or(|id| *id == event.job_id) => {
                    Some(Ok(event))
                }
                Ok(_) => None,
                Err(e) => Some(Err(ClusterError::Decode(e.to_string()))),
            };
            futures::future::ready(item)
        });
        Ok(events.boxed())
    }
}

struct MemoryTerminalControl {
    job_id: String,
    resizes: Arc<Mutex<Vec<(String, u16, u16)>>>,
}

#[async_trait]
impl TerminalControl for MemoryTerminalControl {
    async fn resize(&self, width: u16, height: u16) -> ClusterResult<()> {
        locked(&self.resizes).push((self.job_id.clone(), width, height));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn attach_req(job_id: &str, flags: AttachFlags) -> AttachRequest {
        AttachRequest {
            job_id: job_id.into(),
            flags,
            width: 0,
            height: 0,
        }
    }

    #[tokio::test]
    async fn hosts_listed_in_id_order_with_jobs() {
        let cluster = MemoryCluster::new();
        let b = cluster.add_host("host-b");
        cluster.add_host("host-a");
        b.add_job(HostJob::default()).await.unwrap();

        let hosts = cluster.list_hosts().await.unwrap();
        let ids: Vec<&str> = hosts.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["host-a", "host-b"]);
        assert_eq!(hosts[1].jobs.len(), 1);
        assert_eq!(hosts[1].jobs[0].id, "job0");
    }

    #[tokio::test]
    async fn dial_unknown_host_fails() {
        let cluster = MemoryCluster::new();
        let err = cluster.dial_host("nope").await.err().unwrap();
        assert!(matches!(err, ClusterError::HostNotFound(id) if id == "nope"));
    }

    #[tokio::test]
    async fn stop_removes_and_records() {
        let cluster = MemoryCluster::new();
        let host = cluster.add_host("host0");
        let id = host.add_job(HostJob::default()).await.unwrap();

        let client = cluster.dial_host("host0").await.unwrap();
        client.stop_job(&id).await.unwrap();
        assert_eq!(host.stopped(), vec![id.clone()]);
        assert!(host.jobs().is_empty());
        assert!(client.get_job(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rejected_submission() {
        let cluster = MemoryCluster::new();
        let host = cluster.add_host("host0");
        host.reject_jobs("out of capacity");
        let err = host.add_job(HostJob::default()).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rejected(reason) if reason == "out of capacity"));
    }

    #[tokio::test]
    async fn attach_serves_canned_output() {
        let cluster = MemoryCluster::new();
        let host = cluster.add_host("host0");
        host.set_output("job0", &b"foo"[..]);

        let mut handle = host
            .attach(&attach_req("job0", AttachFlags::STDOUT | AttachFlags::LOGS), false)
            .await
            .unwrap();
        assert!(handle.control.is_none());

        let mut out = Vec::new();
        handle.io.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"foo");
    }

    #[tokio::test]
    async fn attach_unknown_job_fails() {
        let cluster = MemoryCluster::new();
        let host = cluster.add_host("host0");
        let err = host
            .attach(&attach_req("missing", AttachFlags::STDOUT), false)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn interactive_attach_records_resize() {
        let cluster = MemoryCluster::new();
        let host = cluster.add_host("host0");
        host.set_attach_handler(|_, _pipe| {});

        let handle = host
            .attach(&attach_req("job0", AttachFlags::STDIN | AttachFlags::STREAM), true)
            .await
            .unwrap();
        handle.control.unwrap().resize(120, 40).await.unwrap();
        assert_eq!(host.resizes(), vec![("job0".to_string(), 120, 40)]);
        assert!(host.attaches()[0].1);
    }

    #[tokio::test]
    async fn events_filtered_by_job() {
        let cluster = MemoryCluster::new();
        let host = cluster.add_host("host0");
        let mut events = host.stream_events(Some("job1")).await.unwrap();

        host.emit("job0", HostEventKind::Start);
        host.emit("job1", HostEventKind::Start);

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.job_id, "job1");
        assert_eq!(event.kind, HostEventKind::Start);
    }
}
