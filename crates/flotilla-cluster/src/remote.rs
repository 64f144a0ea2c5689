//! HTTP-backed cluster: talks to host agents over HTTP/1.1.
//!
//! Host agent endpoints:
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/host/jobs` | active jobs |
//! | GET | `/host/jobs/{id}` | one job |
//! | POST | `/host/jobs` | submit, returns `{"id": ...}` |
//! | DELETE | `/host/jobs/{id}` | stop |
//! | POST | `/host/jobs/{id}/attach?wait=` | upgrade to a raw byte stream |
//! | POST | `/host/jobs/{id}/resize` | terminal resize |
//! | GET | `/host/events?job_id=` | newline-delimited JSON events |

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE, USER_AGENT};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use flotilla_core::config::HostConfig;
use flotilla_core::{ActiveJob, AttachFlags, AttachRequest, Host, HostEvent, HostJob};

use crate::client::{AttachHandle, ClusterView, HostJobClient, TerminalControl};
use crate::error::{ClusterError, ClusterResult};

/// `Upgrade` token used for attach connections.
pub const ATTACH_PROTOCOL: &str = "flotilla-attach";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A cluster whose hosts are reached over HTTP at fixed addresses.
#[derive(Debug, Clone)]
pub struct HttpCluster {
    hosts: BTreeMap<String, String>,
    timeout: Duration,
}

impl HttpCluster {
    pub fn new(hosts: impl IntoIterator<Item = HostConfig>) -> Self {
        Self {
            hosts: hosts.into_iter().map(|h| (h.id, h.address)).collect(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Per-request timeout for non-streaming host calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn client(&self, host_id: &str) -> Option<HttpHostClient> {
        self.hosts
            .get(host_id)
            .map(|address| HttpHostClient::new(host_id, address, self.timeout))
    }
}

#[async_trait]
impl ClusterView for HttpCluster {
    /// Hosts that fail to answer are logged and left out.
    async fn list_hosts(&self) -> ClusterResult<Vec<Host>> {
        let probes = self.hosts.iter().map(|(id, address)| {
            let client = HttpHostClient::new(id, address, self.timeout);
            async move {
                let result = client.list_jobs().await;
                (client, result)
            }
        });

        let mut hosts = Vec::with_capacity(self.hosts.len());
        for (client, result) in futures::future::join_all(probes).await {
            match result {
                Ok(jobs) => hosts.push(Host {
                    id: client.host_id.clone(),
                    jobs: jobs.into_iter().map(|active| active.job).collect(),
                }),
                Err(e) => warn!(host = %client.host_id, error = %e, "host unreachable, skipping"),
            }
        }
        Ok(hosts)
    }

    async fn dial_host(&self, host_id: &str) -> ClusterResult<Arc<dyn HostJobClient>> {
        match self.client(host_id) {
            Some(client) => Ok(Arc::new(client) as Arc<dyn HostJobClient>),
            None => Err(ClusterError::HostNotFound(host_id.to_string())),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct AddJobResponse {
    id: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct ResizeRequest {
    width: u16,
    height: u16,
}

/// Job client for one host agent.
#[derive(Debug, Clone)]
pub struct HttpHostClient {
    host_id: String,
    address: String,
    timeout: Duration,
}

impl HttpHostClient {
    pub fn new(host_id: &str, address: &str, timeout: Duration) -> Self {
        Self {
            host_id: host_id.to_string(),
            address: address.to_string(),
            timeout,
        }
    }

    fn transport(&self, e: impl std::fmt::Display) -> ClusterError {
        ClusterError::Transport {
            host: self.host_id.clone(),
            message: e.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    fn request(&self, method: Method, path: &str, json: bool) -> http::request::Builder {
        let mut builder = Request::builder()
            .method(method)
            .uri(self.url(path))
            .header(HOST, &self.address)
            .header(USER_AGENT, "flotilla-controller/0.1");
        if json {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        builder
    }

    async fn connect(&self) -> ClusterResult<SendRequest<Full<Bytes>>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.transport("connect timed out"))?
            .map_err(|e| self.transport(e))?;

        let io = TokioIo::new(stream);
        let (sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| self.transport(e))?;

        // Drive the connection in the background; upgrades keep it alive
        // past the response.
        let host = self.host_id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(%host, error = %e, "host connection closed with error");
            }
        });
        Ok(sender)
    }

    /// Send a request, bounded by the client timeout unless `streaming`.
    async fn send(
        &self,
        builder: http::request::Builder,
        body: Option<Vec<u8>>,
        streaming: bool,
    ) -> ClusterResult<Response<Incoming>> {
        let body = body.map(Bytes::from).unwrap_or_default();
        let req = builder
            .body(Full::new(body))
            .map_err(|e| self.transport(e))?;
        let mut sender = self.connect().await?;
        if streaming {
            sender.send_request(req).await.map_err(|e| self.transport(e))
        } else {
            tokio::time::timeout(self.timeout, sender.send_request(req))
                .await
                .map_err(|_| self.transport("request timed out"))?
                .map_err(|e| self.transport(e))
        }
    }

    /// Map a non-success response to an error.
    async fn check(
        &self,
        resp: Response<Incoming>,
        method: &Method,
        path: &str,
        job_id: Option<&str>,
    ) -> ClusterResult<Response<Incoming>> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        match (status, job_id) {
            (StatusCode::NOT_FOUND, Some(job_id)) => {
                Err(ClusterError::JobNotFound(format!("{}-{}", self.host_id, job_id)))
            }
            (StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY, _) => {
                let body = resp
                    .into_body()
                    .collect()
                    .await
                    .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                    .unwrap_or_default();
                Err(ClusterError::Rejected(body))
            }
            _ => Err(ClusterError::UnexpectedStatus {
                method: method.to_string(),
                url: self.url(path),
                status: status.as_u16(),
            }),
        }
    }

    async fn read_json<T: DeserializeOwned>(&self, resp: Response<Incoming>) -> ClusterResult<T> {
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| self.transport(e))?
            .to_bytes();
        serde_json::from_slice(&bytes).map_err(|e| ClusterError::Decode(e.to_string()))
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        job_id: Option<&str>,
    ) -> ClusterResult<Response<Incoming>> {
        let builder = self.request(method.clone(), path, body.is_some());
        let resp = self.send(builder, body, false).await?;
        self.check(resp, &method, path, job_id).await
    }
}

fn encode<T: Serialize>(value: &T) -> ClusterResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ClusterError::Decode(e.to_string()))
}

#[async_trait]
impl HostJobClient for HttpHostClient {
    fn host_id(&self) -> &str {
        &self.host_id
    }

    async fn list_jobs(&self) -> ClusterResult<Vec<ActiveJob>> {
        let resp = self.call(Method::GET, "/host/jobs", None, None).await?;
        self.read_json(resp).await
    }

    async fn get_job(&self, job_id: &str) -> ClusterResult<ActiveJob> {
        let path = format!("/host/jobs/{job_id}");
        let resp = self.call(Method::GET, &path, None, Some(job_id)).await?;
        self.read_json(resp).await
    }

    async fn add_job(&self, job: HostJob) -> ClusterResult<String> {
        let resp = self
            .call(Method::POST, "/host/jobs", Some(encode(&job)?), None)
            .await?;
        let added: AddJobResponse = self.read_json(resp).await?;
        debug!(host = %self.host_id, job_id = %added.id, "job submitted");
        Ok(added.id)
    }

    async fn stop_job(&self, job_id: &str) -> ClusterResult<()> {
        let path = format!("/host/jobs/{job_id}");
        self.call(Method::DELETE, &path, None, Some(job_id)).await?;
        debug!(host = %self.host_id, %job_id, "stop requested");
        Ok(())
    }

    async fn attach(&self, req: &AttachRequest, wait: bool) -> ClusterResult<AttachHandle> {
        let path = format!("/host/jobs/{}/attach?wait={wait}", req.job_id);
        let builder = self
            .request(Method::POST, &path, true)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, ATTACH_PROTOCOL);
        let resp = self.send(builder, Some(encode(req)?), true).await?;

        if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            let resp = self
                .check(resp, &Method::POST, &path, Some(&req.job_id))
                .await?;
            return Err(ClusterError::UnexpectedStatus {
                method: Method::POST.to_string(),
                url: self.url(&path),
                status: resp.status().as_u16(),
            });
        }

        let upgraded = hyper::upgrade::on(resp)
            .await
            .map_err(|e| self.transport(e))?;
        debug!(host = %self.host_id, job_id = %req.job_id, flags = ?req.flags, "attached");

        let mut handle = AttachHandle::new(TokioIo::new(upgraded));
        if req.flags.contains(AttachFlags::STDIN) {
            handle = handle.with_control(Arc::new(HttpTerminalControl {
                client: self.clone(),
                job_id: req.job_id.clone(),
            }));
        }
        Ok(handle)
    }

    async fn stream_events(
        &self,
        job_id: Option<&str>,
    ) -> ClusterResult<BoxStream<'static, ClusterResult<HostEvent>>> {
        let path = match job_id {
            Some(job_id) => format!("/host/events?job_id={job_id}"),
            None => "/host/events".to_string(),
        };
        let builder = self.request(Method::GET, &path, false);
        let resp = self.send(builder, None, true).await?;
        let resp = self.check(resp, &Method::GET, &path, job_id).await?;

        let body = resp.into_body().into_data_stream().map_err(io::Error::other);
        let lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());
        let host = self.host_id.clone();
        let events = lines
            .try_filter(|line| futures::future::ready(!line.trim().is_empty()))
            .map(move |line| match line {
                Ok(line) => serde_json::from_str::<HostEvent>(&line)
                    .map_err(|e| ClusterError::Decode(e.to_string())),
                Err(e) => Err(ClusterError::Transport {
                    host: host.clone(),
                    message: e.to_string(),
                }),
            });
        Ok(events.boxed())
    }
}

/// Resize control for an attach made through [`HttpHostClient`].
struct HttpTerminalControl {
    client: HttpHostClient,
    job_id: String,
}

#[async_trait]
impl TerminalControl for HttpTerminalControl {
    async fn resize(&self, width: u16, height: u16) -> ClusterResult<()> {
        let path = format!("/host/jobs/{}/resize", self.job_id);
        let body = encode(&ResizeRequest { width, height })?;
        self.client
            .call(Method::POST, &path, Some(body), Some(&self.job_id))
            .await?;
        Ok(())
    }
}
