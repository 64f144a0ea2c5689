//! JobDispatcher: turns job requests into host submissions.
//!
//! Host state is never cached: every run, list, kill, and log call asks
//! the cluster afresh.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use flotilla_attach::AttachSession;
use flotilla_cluster::ClusterView;
use flotilla_core::{
    ATTR_APP, ATTR_RELEASE, ATTR_TYPE, App, AttachFlags, AttachRequest, ContainerConfig, HostJob,
    Job, JobId, NewJob, Release,
};
use flotilla_state::StateStore;

use crate::error::{DispatchError, DispatchResult};
use crate::placement::select_host;

/// Effective environment: release < process type < request, sorted `KEY=value`.
pub fn merge_env(layers: &[&HashMap<String, String>]) -> Vec<String> {
    let mut merged = BTreeMap::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            merged.insert(key.as_str(), value.as_str());
        }
    }
    merged
        .into_iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect()
}

/// Container I/O settings for a run.
///
/// Detached runs only capture output. Attached runs also open stdin, closed
/// after the client's first disconnect, and allocate a TTY when asked.
pub fn container_config(
    image: String,
    cmd: Vec<String>,
    env: Vec<String>,
    attach: bool,
    tty: bool,
) -> ContainerConfig {
    ContainerConfig {
        image,
        cmd,
        env,
        tty: attach && tty,
        attach_stdin: attach,
        attach_stdout: true,
        attach_stderr: true,
        open_stdin: attach,
        stdin_once: attach,
    }
}

/// Project a host job into the public shape.
fn public_job(host_id: &str, job: &HostJob) -> Job {
    let attr = |key: &str| job.attributes.get(key).cloned().unwrap_or_default();
    Job {
        id: JobId::new(host_id, &job.id).to_string(),
        process_type: attr(ATTR_TYPE),
        release_id: attr(ATTR_RELEASE),
        cmd: job.config.cmd.clone(),
    }
}

#[derive(Clone)]
pub struct JobDispatcher {
    store: StateStore,
    cluster: Arc<dyn ClusterView>,
}

impl JobDispatcher {
    pub fn new(store: StateStore, cluster: Arc<dyn ClusterView>) -> Self {
        Self { store, cluster }
    }

    pub fn cluster(&self) -> &Arc<dyn ClusterView> {
        &self.cluster
    }

    fn resolve_app(&self, app: &str) -> DispatchResult<App> {
        self.store
            .get_app(app)?
            .ok_or_else(|| DispatchError::AppNotFound(app.to_string()))
    }

    fn resolve_release(&self, release_id: &str) -> DispatchResult<Release> {
        self.store
            .get_release(release_id)?
            .ok_or_else(|| DispatchError::ReleaseNotFound(release_id.to_string()))
    }

    /// Build the host job for `req` without submitting it.
    pub fn prepare(&self, app: &App, req: &NewJob, attach: bool) -> DispatchResult<HostJob> {
        let release = self.resolve_release(&req.release_id)?;
        let artifact = self
            .store
            .get_artifact(&release.artifact_id)?
            .ok_or_else(|| DispatchError::ArtifactNotFound(release.artifact_id.clone()))?;

        let empty = HashMap::new();
        let (process_env, cmd) = match &req.process_type {
            Some(process_type) => {
                let process = release.processes.get(process_type).ok_or_else(|| {
                    DispatchError::ProcessTypeNotFound {
                        release_id: release.id.clone(),
                        process_type: process_type.clone(),
                    }
                })?;
                let cmd = if req.cmd.is_empty() {
                    process.cmd.clone()
                } else {
                    req.cmd.clone()
                };
                (&process.env, cmd)
            }
            None => (&empty, req.cmd.clone()),
        };
        let env = merge_env(&[&release.env, process_env, &req.env]);

        let mut attributes = HashMap::from([
            (ATTR_APP.to_string(), app.id.clone()),
            (ATTR_RELEASE.to_string(), release.id.clone()),
        ]);
        if let Some(process_type) = &req.process_type {
            attributes.insert(ATTR_TYPE.to_string(), process_type.clone());
        }

        Ok(HostJob {
            id: String::new(),
            attributes,
            config: container_config(artifact.uri, cmd, env, attach, req.tty),
        })
    }

    /// Place and submit a job, optionally attaching to it.
    pub async fn run(
        &self,
        app: &str,
        req: &NewJob,
        attach: bool,
    ) -> DispatchResult<(Job, Option<AttachSession>)> {
        let app = self.resolve_app(app)?;
        let host_job = self.prepare(&app, req, attach)?;

        let hosts = self.cluster.list_hosts().await?;
        let host_id = select_host(&hosts)
            .map(|h| h.id.clone())
            .ok_or(DispatchError::NoEligibleHost)?;
        let host = self.cluster.dial_host(&host_id).await?;

        let job_id = host.add_job(host_job.clone()).await?;
        let mut submitted = host_job;
        submitted.id = job_id.clone();
        let job = public_job(&host_id, &submitted);
        info!(app_id = %app.id, job_id = %job.id, release = %req.release_id, attach, "job dispatched");

        if !attach {
            return Ok((job, None));
        }

        let (width, height) = if req.tty {
            (req.columns, req.lines)
        } else {
            (0, 0)
        };
        let request = AttachRequest {
            job_id,
            flags: AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::STDIN | AttachFlags::STREAM,
            width,
            height,
        };
        let session = AttachSession::open(host.as_ref(), request, true).await?;
        Ok((job, Some(session)))
    }

    /// Jobs across all hosts tagged with `app`, grouped by host.
    pub async fn list_jobs(&self, app: &str) -> DispatchResult<Vec<Job>> {
        let app = self.resolve_app(app)?;
        let hosts = self.cluster.list_hosts().await?;
        let jobs: Vec<Job> = hosts
            .iter()
            .flat_map(|host| {
                host.jobs
                    .iter()
                    .filter(|job| job.attributes.get(ATTR_APP) == Some(&app.id))
                    .map(|job| public_job(&host.id, job))
            })
            .collect();
        debug!(app_id = %app.id, jobs = jobs.len(), hosts = hosts.len(), "listed jobs");
        Ok(jobs)
    }

    /// Ask the owning host to stop a job. Does not wait for it to exit.
    pub async fn kill(&self, app: &str, job_id: &str) -> DispatchResult<()> {
        let app = self.resolve_app(app)?;
        let id: JobId = job_id.parse()?;
        let host = self.cluster.dial_host(&id.host_id).await?;
        host.stop_job(&id.job_id).await?;
        info!(app_id = %app.id, %job_id, "job stop requested");
        Ok(())
    }

    /// Open a read-only attach to a job's multiplexed output.
    ///
    /// With `follow`, the attach stays open for new output; otherwise it
    /// ends after the output produced so far.
    pub async fn open_log(
        &self,
        app: &str,
        job_id: &str,
        follow: bool,
    ) -> DispatchResult<AttachSession> {
        self.resolve_app(app)?;
        let id: JobId = job_id.parse()?;
        let host = self.cluster.dial_host(&id.host_id).await?;

        let mut flags = AttachFlags::STDOUT | AttachFlags::STDERR | AttachFlags::LOGS;
        if follow {
            flags = flags | AttachFlags::STREAM;
        }
        let request = AttachRequest {
            job_id: id.job_id,
            flags,
            width: 0,
            height: 0,
        };
        Ok(AttachSession::open(host.as_ref(), request, false).await?)
    }
}
