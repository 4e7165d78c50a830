//! HTTP boundary
//!
//! Routes:
//! - `GET /` usage text
//! - `GET /config?name=&url=&converter=` download a converted configuration
//! - `POST /single-proxy` convert one link (form field `single_proxy`)
//! - `POST /add-subscribe` register a subscription from a JSON body
//! - `GET /metrics` Prometheus text format
//! - `GET /health` liveness

use crate::entry::{config_name, subscription_name};
use crate::error::{ConvertError, Result};
use crate::manager::{CacheManager, Registration};
use crate::metrics::MetricsSnapshot;
use crate::models::GlobalOverrides;
use crate::vmess::VMESS_CONVERTER;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_DISPOSITION, CONTENT_TYPE, HOST};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const USAGE: &str = "clash-subconvert

GET  /config?name=<name>[&url=<subscription url>&converter=vmess]
POST /single-proxy          form field single_proxy=<vmess link>
POST /add-subscribe         {\"subscribe_input\": <url>, \"port\": 7890, \"socks_port\": 7891, \"allow_lan\": false}
GET  /metrics
GET  /health
";

/// Routes requests to the cache manager
pub struct RequestHandler {
    manager: Arc<CacheManager>,
    default_interval: i64,
    metrics_enabled: bool,
}

impl RequestHandler {
    pub fn new(manager: Arc<CacheManager>) -> Self {
        RequestHandler {
            manager,
            default_interval: 60,
            metrics_enabled: true,
        }
    }

    /// Refresh interval in minutes for subscriptions registered over HTTP
    pub fn with_default_interval(mut self, minutes: i64) -> Self {
        self.default_interval = minutes;
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.metrics_enabled = enabled;
        self
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    /// Handle one request; errors are rendered as plain-text responses
    pub async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        debug!("{} {}", method, path);

        let result = match (method.clone(), path.as_str()) {
            (Method::GET, "/") => Ok(text_response(StatusCode::OK, USAGE)),
            (Method::GET, "/config") => self.config(req.uri().query().unwrap_or("")).await,
            (Method::POST, "/single-proxy") => self.single_proxy(req).await,
            (Method::POST, "/add-subscribe") => self.add_subscribe(req).await,
            (Method::GET, "/metrics") if self.metrics_enabled => Ok(self.metrics()),
            (Method::GET, "/health") => Ok(self.health()),
            (_, "/" | "/config" | "/single-proxy" | "/add-subscribe" | "/health") => Ok(
                text_response(StatusCode::METHOD_NOT_ALLOWED, "405 Method Not Allowed"),
            ),
            _ => Ok(text_response(StatusCode::NOT_FOUND, "404 Not Found")),
        };

        result.unwrap_or_else(|e| {
            warn!("{} {} failed: {}", method, path, e);
            error_response(&e)
        })
    }

    async fn config(&self, query: &str) -> Result<Response<Full<Bytes>>> {
        let name = form_value(query.as_bytes(), "name")
            .ok_or_else(|| ConvertError::BadRequest("name is required".to_string()))?;

        if let Some(config) = self.manager.get(&name).await? {
            let file_name = self
                .manager
                .entry(&name)
                .map(|entry| entry.config_name().to_string())
                .unwrap_or_else(|| name.clone());
            return yaml_attachment(&config.to_yaml()?, &file_name);
        }

        if let Some(url) = form_value(query.as_bytes(), "url") {
            let converter =
                form_value(query.as_bytes(), "converter").unwrap_or_else(|| VMESS_CONVERTER.to_string());

            let config = self.manager.fetch_and_convert(&url, &converter).await?;
            let body = config.to_yaml()?;
            self.manager.register_with(
                Registration::new(name, converter, url.clone(), self.default_interval)
                    .with_seed(config),
            )?;
            return yaml_attachment(&body, &config_name(&url));
        }

        let template = self.manager.template(VMESS_CONVERTER)?;
        yaml_attachment(&template.to_yaml()?, &name)
    }

    async fn single_proxy<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Display,
    {
        let query = req.uri().query().unwrap_or("").to_string();
        let body = read_body(req.into_body()).await?;

        let link = form_value(&body, "single_proxy")
            .or_else(|| form_value(query.as_bytes(), "single_proxy"))
            .ok_or_else(|| ConvertError::BadRequest("single_proxy must not be empty".to_string()))?;

        let descriptor = self.manager.convert_single(VMESS_CONVERTER, &link)?;
        yaml_attachment(&descriptor.to_yaml()?, "config")
    }

    async fn add_subscribe<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>>
    where
        B: Body,
        B::Error: Display,
    {
        let base = public_base_url(&req);
        let body = read_body(req.into_body()).await?;
        let request: SubscribeRequest = serde_json::from_slice(&body)
            .map_err(|e| ConvertError::BadRequest(format!("invalid request body: {}", e)))?;

        let url = request.subscribe_input.trim().to_string();
        url::Url::parse(&url).map_err(|e| {
            ConvertError::BadRequest(format!("invalid subscribe_input '{}': {}", url, e))
        })?;

        let name = subscription_name(&url);
        let link = format!("{}/config?name={}", base, name);
        if self.manager.contains(&name) {
            return Ok(text_response(StatusCode::OK, link));
        }

        let config = self.manager.fetch_and_convert(&url, VMESS_CONVERTER).await?;
        self.manager.register_with(
            Registration::new(name, VMESS_CONVERTER, url, self.default_interval)
                .with_seed(config)
                .with_overrides(request.overrides()),
        )?;

        Ok(text_response(StatusCode::OK, link))
    }

    fn metrics(&self) -> Response<Full<Bytes>> {
        let snapshot = self.manager.metrics().get_stats();
        let mut response = text_response(StatusCode::OK, format_prometheus_metrics(&snapshot));
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
        );
        response
    }

    fn health(&self) -> Response<Full<Bytes>> {
        let (status, label) = if self.manager.is_shut_down() {
            (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
        } else {
            (StatusCode::OK, "healthy")
        };
        let body = serde_json::json!({
            "status": label,
            "subscriptions": self.manager.len(),
        });
        let mut response = text_response(status, body.to_string());
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response
    }
}

/// Body of `POST /add-subscribe`
///
/// Ports are accepted as JSON numbers or numeric strings.
#[derive(Debug, Deserialize)]
struct SubscribeRequest {
    #[serde(default)]
    port: Value,
    #[serde(default)]
    socks_port: Value,
    #[serde(default)]
    allow_lan: bool,
    subscribe_input: String,
}

impl SubscribeRequest {
    fn overrides(&self) -> GlobalOverrides {
        GlobalOverrides {
            port: json_port(&self.port),
            socks_port: json_port(&self.socks_port),
            allow_lan: Some(self.allow_lan),
        }
    }
}

fn json_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }?;
    u16::try_from(port).ok().filter(|p| *p != 0)
}

/// First non-empty value of `key` in a urlencoded form
fn form_value(data: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(data)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn read_body<B>(body: B) -> Result<Bytes>
where
    B: Body,
    B::Error: Display,
{
    body.collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| ConvertError::BadRequest(format!("failed to read request body: {}", e)))
}

/// `scheme://host` this server was reached at
fn public_base_url<B>(req: &Request<B>) -> String {
    let scheme = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(|h| h.to_string())
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_else(|| "127.0.0.1".to_string());
    format!("{}://{}", scheme, host)
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// `Content-Disposition` value for a YAML download
///
/// Quotes, backslashes and control characters are dropped from the name.
/// Non-ASCII names get an ASCII `filename` fallback plus an RFC 6266
/// `filename*`.
fn attachment_disposition(file_name: &str) -> String {
    let clean: String = file_name
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();

    if clean.is_ascii() {
        return format!("attachment; filename=\"{}.yaml\"", clean);
    }

    let fallback: String = clean
        .chars()
        .map(|c| if c.is_ascii() { c } else { '_' })
        .collect();
    format!(
        "attachment; filename=\"{}.yaml\"; filename*=UTF-8''{}.yaml",
        fallback,
        urlencoding::encode(&clean)
    )
}

fn yaml_attachment(yaml: &str, file_name: &str) -> Result<Response<Full<Bytes>>> {
    let disposition = HeaderValue::from_str(&attachment_disposition(file_name))
        .map_err(|e| ConvertError::BadRequest(format!("invalid file name '{}': {}", file_name, e)))?;

    let mut response = text_response(StatusCode::OK, yaml.to_string());
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
    headers.insert(CONTENT_DISPOSITION, disposition);
    Ok(response)
}

fn error_response(err: &ConvertError) -> Response<Full<Bytes>> {
    let status =
        StatusCode::from_u16(err.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    text_response(status, err.to_string())
}

/// Format manager metrics in Prometheus exposition format
pub fn format_prometheus_metrics(snapshot: &MetricsSnapshot) -> String {
    let mut output = String::new();
    let mut metric = |name: &str, kind: &str, help: &str, value: String| {
        output.push_str(&format!("# HELP clash_subconvert_{} {}\n", name, help));
        output.push_str(&format!("# TYPE clash_subconvert_{} {}\n", name, kind));
        output.push_str(&format!("clash_subconvert_{} {}\n\n", name, value));
    };

    // Registry
    metric(
        "registrations_total",
        "counter",
        "Number of subscription registrations",
        snapshot.registrations.to_string(),
    );
    metric(
        "replacements_total",
        "counter",
        "Registrations that replaced an existing entry",
        snapshot.replacements.to_string(),
    );

    // Refresh
    metric(
        "refresh_successes_total",
        "counter",
        "Successful background refreshes",
        snapshot.refresh_successes.to_string(),
    );
    metric(
        "refresh_failures_total",
        "counter",
        "Failed background refreshes",
        snapshot.refresh_failures.to_string(),
    );
    metric(
        "refresh_failure_rate",
        "gauge",
        "Background refresh failure rate percentage",
        format!("{:.2}", snapshot.refresh_failure_rate()),
    );
    metric(
        "active_refresh_tasks",
        "gauge",
        "Live background refresh tasks",
        snapshot.active_refresh_tasks.to_string(),
    );
    metric(
        "on_demand_fetches_total",
        "counter",
        "Fetches triggered by a read with no cached configuration",
        snapshot.on_demand_fetches.to_string(),
    );
    metric(
        "conversion_failures_total",
        "counter",
        "Subscriptions that failed format conversion",
        snapshot.conversion_failures.to_string(),
    );

    // Snapshot
    metric(
        "snapshot_writes_total",
        "counter",
        "Successful snapshot writes",
        snapshot.snapshot_writes.to_string(),
    );
    metric(
        "snapshot_failures_total",
        "counter",
        "Failed snapshot writes",
        snapshot.snapshot_failures.to_string(),
    );
    metric(
        "snapshot_restored_entries",
        "gauge",
        "Entries restored from the snapshot at startup",
        snapshot.snapshot_restored_entries.to_string(),
    );

    output
}

/// HTTP server in front of a [`CacheManager`]
pub struct SubscriptionServer {
    handler: Arc<RequestHandler>,
    addr: SocketAddr,
}

impl SubscriptionServer {
    pub fn new(handler: RequestHandler, addr: SocketAddr) -> Self {
        SubscriptionServer {
            handler: Arc::new(handler),
            addr,
        }
    }

    /// Bind the configured address and serve until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            ConvertError::IoError(format!("Failed to bind {}: {}", self.addr, e))
        })?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!("Starting http server -> http://{}", local);

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Http server on {} stopped", local);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Failed to accept connection: {}", e);
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let handler = Arc::clone(&self.handler);
            let shutdown = shutdown.clone();

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>(handler.handle(req).await) }
                });

                let conn = http1::Builder::new().serve_connection(io, service);
                tokio::pin!(conn);
                let mut draining = false;
                loop {
                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                error!("Error serving connection from {}: {:?}", peer, err);
                            }
                            break;
                        }
                        _ = shutdown.cancelled(), if !draining => {
                            draining = true;
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                }
            });
        }
    }
}
