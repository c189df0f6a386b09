//! Request handling: hostname → app → lease → ensure running → forward.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{header, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, info, warn};

use sandpiper_broker::{ops, Broker, ProcessState, SandboxContext, APP_PORT};

use crate::directory::{AppDirectory, AppRecord};
use crate::error::{ProxyError, Result};
use crate::upgrade;

/// Body type for outgoing responses
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Empty body utility
pub fn empty_body() -> BoxBody {
    http_body_util::Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Full body utility
pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Name of the per-sandbox process that runs the user's app.
const APP_PROCESS: &str = "app";
/// Working directory of the app process inside the sandbox.
const APP_RUN_PATH: &str = "/app";

const READY_POLL_INTERVAL: Duration = Duration::from_millis(10);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// App proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Second-to-last host label that marks a host as an app host
    /// (`<app>.<label>.<tld>`).
    pub app_domain_label: String,
    /// How long a request waits for the app to reach the running state.
    pub ready_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            app_domain_label: "sandpiper".to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Extract the app name from a request host.
///
/// The leading label is the app name; the label just before the TLD must
/// match the configured app-domain label.
pub fn app_name_from_host<'a>(host: &'a str, label: &str) -> Option<&'a str> {
    let host = host.split(':').next().unwrap_or(host);
    let parts: Vec<&str> = host.split('.').collect();
    if parts.len() < 2 || parts[parts.len() - 2] != label {
        return None;
    }
    Some(parts[0])
}

/// Enable the app process with the record's launch command and environment.
/// Idempotent while the process is already up.
pub async fn enable_app_process(ctx: &SandboxContext, app: &AppRecord) -> Result<()> {
    ops::configure_process(
        ctx,
        APP_PROCESS,
        &app.launch_cmd(),
        APP_RUN_PATH,
        APP_PORT,
        &app.launch_env(),
    )
    .await?;
    Ok(())
}

/// Restart the app process with a fresh command line and environment.
pub async fn restart_app_process(ctx: &SandboxContext, app: &AppRecord) -> Result<()> {
    ops::restart_process(ctx, APP_PROCESS, &app.launch_cmd(), &app.launch_env()).await?;
    Ok(())
}

/// Reverse proxy that maps app hostnames onto running sandboxes.
pub struct AppProxy {
    broker: Arc<Broker>,
    directory: Arc<dyn AppDirectory>,
    config: ProxyConfig,
    client: Client<HttpConnector, BoxBody>,
}

impl AppProxy {
    pub fn new(broker: Arc<Broker>, directory: Arc<dyn AppDirectory>, config: ProxyConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http2_only(false)
            .build_http();
        Self {
            broker,
            directory,
            config,
            client,
        }
    }

    /// Handle one incoming request end to end. Never fails: errors become
    /// status responses.
    pub async fn handle(&self, req: Request<Incoming>, remote: SocketAddr) -> Response<BoxBody> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.route(req, remote).await {
            Ok(resp) => resp,
            Err(err) => {
                let status = err.status_code();
                if status.is_server_error() {
                    warn!(method = %method, path = %path, error = %err, "Proxy request failed");
                } else {
                    debug!(method = %method, path = %path, error = %err, "Proxy request rejected");
                }
                error_response(&err)
            }
        }
    }

    async fn route(&self, req: Request<Incoming>, remote: SocketAddr) -> Result<Response<BoxBody>> {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(|| req.uri().host().map(str::to_string))
            .unwrap_or_default();

        let name = app_name_from_host(&host, &self.config.app_domain_label)
            .ok_or(ProxyError::NotAnAppHost { host: host.clone() })?
            .to_string();

        let app = self
            .directory
            .app_by_name(&name)
            .await
            .map_err(ProxyError::Directory)?
            .ok_or(ProxyError::AppNotFound { name: name.clone() })?;

        let lease = self.broker.lease(&app.id, "", &app.worktree_id).await?;

        self.ensure_running(&lease, &app).await?;
        let target = lease.app_endpoint().to_string();

        info!(
            app = %app.name,
            target = %target,
            method = %req.method(),
            path = %req.uri().path(),
            "Forwarding request"
        );

        if upgrade::is_websocket_upgrade(&req) {
            // The lease rides along with the tunnel and is released when
            // the spliced connection closes.
            upgrade::proxy_upgrade(req, target, lease).await
        } else {
            self.forward(req, &target, remote).await
        }
    }

    /// Enable the app process and wait for the tracker to observe it
    /// running. A `Finished` observation or the readiness timeout both end
    /// the wait.
    async fn ensure_running(&self, ctx: &SandboxContext, app: &AppRecord) -> Result<()> {
        enable_app_process(ctx, app).await?;

        let started = std::time::Instant::now();
        loop {
            match ctx.app_state() {
                ProcessState::Running => return Ok(()),
                ProcessState::Finished => {
                    return Err(ProxyError::AppFinished {
                        app: app.name.clone(),
                    })
                }
                _ => {}
            }
            if started.elapsed() > self.config.ready_timeout {
                return Err(ProxyError::ReadyTimeout {
                    app: app.name.clone(),
                });
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        target: &str,
        remote: SocketAddr,
    ) -> Result<Response<BoxBody>> {
        let (mut parts, body) = req.into_parts();

        // The resolved endpoint goes straight into the rewritten URI.
        let new_uri = format!(
            "http://{}{}{}",
            target,
            parts.uri.path(),
            parts
                .uri
                .query()
                .map(|q| format!("?{q}"))
                .unwrap_or_default()
        );
        parts.uri = new_uri
            .parse::<Uri>()
            .map_err(|err| ProxyError::InvalidRequest(format!("Invalid URI: {err}")))?;

        add_forwarding_headers(&mut parts, remote);
        remove_hop_by_hop_headers(&mut parts);

        let body_bytes = body
            .collect()
            .await
            .map_err(|err| ProxyError::Backend(err.to_string()))?
            .to_bytes();
        let backend_req = Request::from_parts(parts, full_body(body_bytes));

        let response = self
            .client
            .request(backend_req)
            .await
            .map_err(|err| ProxyError::Backend(err.to_string()))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|err| ProxyError::Backend(err.to_string()))?
            .to_bytes();
        Ok(Response::from_parts(parts, full_body(body)))
    }
}

fn add_forwarding_headers(parts: &mut http::request::Parts, remote: SocketAddr) {
    let client_ip = remote.ip().to_string();

    let forwarded_for = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .map(|existing| format!("{existing}, {client_ip}"))
        .unwrap_or_else(|| client_ip.clone());
    if let Ok(value) = forwarded_for.parse() {
        parts.headers.insert("x-forwarded-for", value);
    }

    if parts.headers.get("x-real-ip").is_none() {
        if let Ok(value) = client_ip.parse() {
            parts.headers.insert("x-real-ip", value);
        }
    }

    if let Some(host) = parts.headers.get(header::HOST).cloned() {
        if parts.headers.get("x-forwarded-host").is_none() {
            parts.headers.insert("x-forwarded-host", host);
        }
    }
}

fn remove_hop_by_hop_headers(parts: &mut http::request::Parts) {
    // Headers named by the Connection header go first, before we drop it.
    let connection_headers: Vec<String> = parts
        .headers
        .get(header::CONNECTION)
        .and_then(|h| h.to_str().ok())
        .map(|value| value.split(',').map(|s| s.trim().to_lowercase()).collect())
        .unwrap_or_default();

    const HOP_BY_HOP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
    ];

    for name in HOP_BY_HOP {
        parts.headers.remove(*name);
    }
    for name in connection_headers {
        parts.headers.remove(name.as_str());
    }
}

/// Render an error as a JSON status response.
pub fn error_response(error: &ProxyError) -> Response<BoxBody> {
    let status = error.status_code();
    let body = format!("{{\"error\": \"{error}\"}}");

    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(empty_body()))
}
