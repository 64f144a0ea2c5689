//! Controller API client over HTTP/1.1.
//!
//! Every call opens its own connection. Non-200 responses become
//! [`ClientError::NotFound`] (404) or [`ClientError::UnexpectedStatus`].

use std::io;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use http::header::{ACCEPT, CONNECTION, CONTENT_TYPE, HOST, UPGRADE, USER_AGENT};
use http::{Method, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use flotilla_core::{App, Artifact, ExpandedFormation, FeedEvent, Formation, Job, NewJob, Release};

use crate::error::{ClientError, ClientResult};
use crate::events::SseCodec;

/// Default controller address.
pub const DEFAULT_URL: &str = "http://127.0.0.1:1200";

const ATTACH_MEDIA_TYPE: &str = "application/vnd.flynn.attach";
const ATTACH_PROTOCOL: &str = "flotilla-attach";
const EVENT_STREAM: &str = "text/event-stream";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The raw byte stream of an attached job run.
pub type AttachStream = TokioIo<Upgraded>;

#[derive(Debug, Clone)]
pub struct Client {
    base: String,
    authority: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ReleaseRef<'a> {
    id: &'a str,
}

impl Client {
    /// Create a client for `url` (`http://host:port`).
    pub fn new(url: &str) -> ClientResult<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| ClientError::Validation(format!("invalid controller url {url}: {e}")))?;
        if uri.scheme_str().is_some_and(|s| s != "http") {
            return Err(ClientError::Validation(format!("unsupported scheme in {url}")));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| ClientError::Validation(format!("missing host in {url}")))?
            .to_string();
        Ok(Self {
            base: format!("http://{authority}"),
            authority,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Timeout for non-streaming calls.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn connect(&self) -> ClientResult<SendRequest<Full<Bytes>>> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.authority))
            .await
            .map_err(|_| ClientError::Http(format!("connect to {} timed out", self.authority)))?
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!(error = %e, "controller connection closed with error");
            }
        });
        Ok(sender)
    }

    fn builder(&self, method: &Method, path: &str) -> http::request::Builder {
        Request::builder()
            .method(method.clone())
            .uri(self.url(path))
            .header(HOST, &self.authority)
            .header(USER_AGENT, "flotilla-client/0.1")
    }

    async fn send(
        &self,
        builder: http::request::Builder,
        body: Option<Vec<u8>>,
        streaming: bool,
    ) -> ClientResult<Response<Incoming>> {
        let req = builder
            .body(Full::new(body.map(Bytes::from).unwrap_or_default()))
            .map_err(|e| ClientError::Http(e.to_string()))?;
        let mut sender = self.connect().await?;
        if streaming {
            sender
                .send_request(req)
                .await
                .map_err(|e| ClientError::Http(e.to_string()))
        } else {
            tokio::time::timeout(self.timeout, sender.send_request(req))
                .await
                .map_err(|_| ClientError::Http("request timed out".to_string()))?
                .map_err(|e| ClientError::Http(e.to_string()))
        }
    }

    fn check(
        &self,
        resp: Response<Incoming>,
        method: &Method,
        path: &str,
        expected: StatusCode,
    ) -> ClientResult<Response<Incoming>> {
        match resp.status() {
            status if status == expected => Ok(resp),
            StatusCode::NOT_FOUND => Err(ClientError::NotFound(self.url(path))),
            status => Err(ClientError::UnexpectedStatus {
                method: method.to_string(),
                url: self.url(path),
                status: status.as_u16(),
            }),
        }
    }

    async fn call<I: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&I>,
    ) -> ClientResult<Response<Incoming>> {
        let mut builder = self.builder(&method, path);
        let body = match body {
            Some(body) => {
                builder = builder.header(CONTENT_TYPE, "application/json");
                Some(serde_json::to_vec(body).map_err(|e| ClientError::Decode(e.to_string()))?)
            }
            None => None,
        };
        let resp = self.send(builder, body, false).await?;
        self.check(resp, &method, path, StatusCode::OK)
    }

    async fn read_json<T: DeserializeOwned>(&self, resp: Response<Incoming>) -> ClientResult<T> {
        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?
            .to_bytes();
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let resp = self.call::<()>(Method::GET, path, None).await?;
        self.read_json(resp).await
    }

    async fn send_json<I: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: &I,
    ) -> ClientResult<T> {
        let resp = self.call(method, path, Some(body)).await?;
        self.read_json(resp).await
    }

    // ── Apps ───────────────────────────────────────────────────────

    pub async fn create_app(&self, app: &App) -> ClientResult<App> {
        self.send_json(Method::POST, "/apps", app).await
    }

    pub async fn get_app(&self, app: &str) -> ClientResult<App> {
        self.get(&format!("/apps/{app}")).await
    }

    pub async fn list_apps(&self) -> ClientResult<Vec<App>> {
        self.get("/apps").await
    }

    pub async fn delete_app(&self, app: &str) -> ClientResult<()> {
        self.call::<()>(Method::DELETE, &format!("/apps/{app}"), None)
            .await?;
        Ok(())
    }

    pub async fn set_app_release(&self, app: &str, release_id: &str) -> ClientResult<()> {
        let path = format!("/apps/{app}/release");
        self.call(Method::PUT, &path, Some(&ReleaseRef { id: release_id }))
            .await?;
        Ok(())
    }

    pub async fn get_app_release(&self, app: &str) -> ClientResult<Release> {
        self.get(&format!("/apps/{app}/release")).await
    }

    // ── Releases & artifacts ───────────────────────────────────────

    pub async fn create_release(&self, release: &Release) -> ClientResult<Release> {
        self.send_json(Method::POST, "/releases", release).await
    }

    pub async fn get_release(&self, id: &str) -> ClientResult<Release> {
        self.get(&format!("/releases/{id}")).await
    }

    pub async fn create_artifact(&self, artifact: &Artifact) -> ClientResult<Artifact> {
        self.send_json(Method::POST, "/artifacts", artifact).await
    }

    pub async fn get_artifact(&self, id: &str) -> ClientResult<Artifact> {
        self.get(&format!("/artifacts/{id}")).await
    }

    // ── Formations ─────────────────────────────────────────────────

    /// Upsert a formation. Both `app_id` and `release_id` must be set.
    pub async fn put_formation(&self, formation: &Formation) -> ClientResult<Formation> {
        if formation.app_id.is_empty() || formation.release_id.is_empty() {
            return Err(ClientError::Validation(
                "missing app id and/or release id".to_string(),
            ));
        }
        let path = format!(
            "/apps/{}/formations/{}",
            formation.app_id, formation.release_id
        );
        self.send_json(Method::PUT, &path, formation).await
    }

    pub async fn get_formation(&self, app: &str, release_id: &str) -> ClientResult<Formation> {
        self.get(&format!("/apps/{app}/formations/{release_id}"))
            .await
    }

    pub async fn list_formations(&self, app: &str) -> ClientResult<Vec<Formation>> {
        self.get(&format!("/apps/{app}/formations")).await
    }

    pub async fn delete_formation(&self, app: &str, release_id: &str) -> ClientResult<()> {
        let path = format!("/apps/{app}/formations/{release_id}");
        self.call::<()>(Method::DELETE, &path, None).await?;
        Ok(())
    }

    /// Formation changes since `since` (the Unix epoch when `None`): the
    /// replay, a [`FeedEvent::ReplayComplete`] marker, then live changes.
    pub async fn stream_formations(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> ClientResult<BoxStream<'static, ClientResult<FeedEvent>>> {
        let since = since.unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        let path = format!(
            "/formations?since={}",
            since.to_rfc3339_opts(SecondsFormat::Micros, true)
        );
        let builder = self.builder(&Method::GET, &path).header(ACCEPT, EVENT_STREAM);
        let resp = self.send(builder, None, true).await?;
        let resp = self.check(resp, &Method::GET, &path, StatusCode::OK)?;

        let body = resp.into_body().into_data_stream().map_err(io::Error::other);
        let events = FramedRead::new(StreamReader::new(body), SseCodec::new())
            .map_err(|e| ClientError::Decode(e.to_string()))
            .try_filter_map(|event| async move {
                match event.event.as_str() {
                    "ready" => Ok(Some(FeedEvent::ReplayComplete)),
                    "formation" => serde_json::from_str::<ExpandedFormation>(&event.data)
                        .map(|f| Some(FeedEvent::Formation(f)))
                        .map_err(|e| ClientError::Decode(e.to_string())),
                    other => {
                        warn!(event = %other, "ignoring unknown formation stream event");
                        Ok(None)
                    }
                }
            });
        Ok(events.boxed())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    pub async fn list_jobs(&self, app: &str) -> ClientResult<Vec<Job>> {
        self.get(&format!("/apps/{app}/jobs")).await
    }

    /// Run a job without attaching to it.
    pub async fn run_job(&self, app: &str, job: &NewJob) -> ClientResult<Job> {
        self.send_json(Method::POST, &format!("/apps/{app}/jobs"), job)
            .await
    }

    /// Run a job and attach to it. Writes go to the job's stdin; shutting
    /// down the write side closes stdin. Reads return stdout and stderr.
    pub async fn run_job_attached(&self, app: &str, job: &NewJob) -> ClientResult<AttachStream> {
        let path = format!("/apps/{app}/jobs");
        let body = serde_json::to_vec(job).map_err(|e| ClientError::Decode(e.to_string()))?;
        let builder = self
            .builder(&Method::POST, &path)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, ATTACH_MEDIA_TYPE)
            .header(CONNECTION, "upgrade")
            .header(UPGRADE, ATTACH_PROTOCOL);
        let resp = self.send(builder, Some(body), true).await?;
        let resp = self.check(resp, &Method::POST, &path, StatusCode::SWITCHING_PROTOCOLS)?;
        let upgraded = hyper::upgrade::on(resp)
            .await
            .map_err(|e| ClientError::Http(e.to_string()))?;
        Ok(TokioIo::new(upgraded))
    }

    pub async fn kill_job(&self, app: &str, job_id: &str) -> ClientResult<()> {
        self.call::<()>(Method::DELETE, &format!("/apps/{app}/jobs/{job_id}"), None)
            .await?;
        Ok(())
    }

    /// A job's raw multiplexed output. With `follow` the stream stays open
    /// for new output.
    pub async fn job_log(
        &self,
        app: &str,
        job_id: &str,
        follow: bool,
    ) -> ClientResult<BoxStream<'static, ClientResult<Bytes>>> {
        let path = format!("/apps/{app}/jobs/{job_id}/log?follow={follow}");
        let builder = self.builder(&Method::GET, &path);
        let resp = self.send(builder, None, true).await?;
        let resp = self.check(resp, &Method::GET, &path, StatusCode::OK)?;
        Ok(resp
            .into_body()
            .into_data_stream()
            .map_err(|e| ClientError::Http(e.to_string()))
            .boxed())
    }
}
