//! Stdio↔HTTP Adapter (component C) — for each stdio backend, a loopback
//! HTTP listener that translates requests into line-delimited JSON over the
//! child's stdin/stdout.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router as AxumRouter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::error::{GatewayError, Result};
use crate::logging::GatewayEvent;
use crate::supervisor::{ProcessSupervisor, StdioChannel};

const DEFAULT_MAX_BUFFER_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_URL_LEN: usize = 2048;
const MAX_HEADER_VALUE_LEN: usize = 1024;
/// Bound on how long a timed-out round trip keeps draining the child's
/// stdout for its late reply before handing the channel back clean.
const STALE_REPLY_DRAIN_GRACE: Duration = Duration::from_millis(200);

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS"];
const ALLOWED_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "authorization",
    "accept",
    "accept-encoding",
    "accept-language",
    "user-agent",
    "x-forwarded-for",
    "x-real-ip",
    "host",
];

/// Wire format written to the child's stdin.
#[derive(Debug, Serialize)]
struct ChildRequest {
    method: String,
    url: String,
    headers: HashMap<String, String>,
    body: String,
}

/// Wire format read back from the child's stdout.
#[derive(Debug, Deserialize, Default)]
struct ChildReply {
    #[serde(default = "default_status")]
    status_code: u16,
    #[serde(default)]
    body: Value,
}

fn default_status() -> u16 {
    200
}

/// One loopback HTTP front for a single stdio backend.
///
/// Holds no reference to the child itself — every round trip fetches the
/// current [`StdioChannel`] from the supervisor, so a restart transparently
/// swaps in the new child's pipes without the adapter ever dangling.
struct AdapterInstance {
    is_healthy: AtomicBool,
    started_at: Instant,
    last_activity_ms: AtomicI64,
    // serializes stdio round trips: only one in-flight request per child.
    stdio_lock: Mutex<()>,
}

impl AdapterInstance {
    fn touch(&self) {
        self.last_activity_ms
            .store(self.started_at.elapsed().as_millis() as i64, Ordering::Relaxed);
    }
}

#[derive(Clone)]
struct AdapterState {
    name: String,
    instance: Arc<AdapterInstance>,
    supervisor: Arc<ProcessSupervisor>,
    request_timeout: Duration,
    max_buffer_size: usize,
}

/// Owns every backend's loopback HTTP front and the child stdio plumbing.
pub struct StdioHttpAdapter {
    supervisor: Arc<ProcessSupervisor>,
    instances: RwLock<HashMap<String, Arc<AdapterInstance>>>,
    servers: Mutex<HashMap<String, tokio::task::JoinHandle<()>>>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    request_timeout: Duration,
    max_buffer_size: usize,
}

impl StdioHttpAdapter {
    pub fn new(supervisor: Arc<ProcessSupervisor>, events: mpsc::UnboundedSender<GatewayEvent>) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            instances: RwLock::new(HashMap::new()),
            servers: Mutex::new(HashMap::new()),
            events,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
        })
    }

    /// Bind a loopback listener on `port` for `name` and start accepting.
    /// `has_command` marks a command-less adapter (just waiting on an
    /// externally-managed process) as healthy immediately; otherwise health
    /// tracks whether the supervisor currently reports a live channel.
    pub async fn create_adapter(self: &Arc<Self>, name: &str, port: u16, has_command: bool) -> Result<()> {
        let instance = Arc::new(AdapterInstance {
            is_healthy: AtomicBool::new(!has_command),
            started_at: Instant::now(),
            last_activity_ms: AtomicI64::new(0),
            stdio_lock: Mutex::new(()),
        });
        self.instances.write().await.insert(name.to_string(), instance.clone());

        let state = AdapterState {
            name: name.to_string(),
            instance,
            supervisor: self.supervisor.clone(),
            request_timeout: self.request_timeout,
            max_buffer_size: self.max_buffer_size,
        };

        let app: AxumRouter = AxumRouter::new()
            .route("/health", any(health_handler))
            .fallback(any(handle_request))
            .with_state(state);

        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app.into_make_service()).await;
        });
        self.servers.lock().await.insert(name.to_string(), handle);

        let _ = self.events.send(GatewayEvent::AdapterReady { name: name.to_string(), port });
        Ok(())
    }

    /// True once a spawned child has a live stdio channel, or permanently
    /// for command-less adapters that were never asked to spawn one.
    pub async fn is_healthy(&self, name: &str) -> bool {
        if self.supervisor.stdio_channel(name).await.is_some() {
            return true;
        }
        self.instances
            .read()
            .await
            .get(name)
            .map(|i| i.is_healthy.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    /// Close the loopback listener. Idempotent for unknown names. Stopping
    /// the child itself (term, wait, force-kill) is the supervisor's job —
    /// `Gateway::shutdown` calls `stop_all_servers` before this.
    pub async fn stop_adapter(&self, name: &str) -> Result<()> {
        if let Some(handle) = self.servers.lock().await.remove(name) {
            handle.abort();
        }
        self.instances.write().await.remove(name);
        let _ = self.events.send(GatewayEvent::AdapterStopped { name: name.to_string() });
        Ok(())
    }

    pub async fn stop_all_adapters(&self) {
        let names: Vec<String> = self.instances.read().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop_adapter(&name).await;
        }
    }
}

async fn health_handler(State(state): State<AdapterState>) -> Response {
    state.instance.touch();
    let has_child = state.supervisor.stdio_channel(&state.name).await.is_some();
    let healthy = has_child || state.instance.is_healthy.load(Ordering::Relaxed);
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "server": state.name,
        "type": "stdio",
        "uptimeMs": state.instance.started_at.elapsed().as_millis() as u64,
        "lastActivity": state.instance.last_activity_ms.load(Ordering::Relaxed),
        "hasChildProcess": has_child,
    });
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, axum::Json(body)).into_response()
}

async fn handle_request(
    State(state): State<AdapterState>,
    method: Method,
    headers: HeaderMap,
    req: Request,
) -> Response {
    state.instance.touch();

    if method == Method::OPTIONS {
        return cors_preflight();
    }

    let Some(channel) = state.supervisor.stdio_channel(&state.name).await else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Service not available");
    };

    let uri = req.uri().clone();
    let path_and_query = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    if let Err(e) = validate_method(method.as_str()) {
        return map_error(e);
    }
    if let Err(e) = validate_url(&path_and_query) {
        return map_error(e);
    }
    let sanitized_headers = match validate_headers(&headers) {
        Ok(h) => h,
        Err(e) => return map_error(e),
    };

    let body = match axum::body::to_bytes(req.into_body(), state.max_buffer_size + 1).await {
        Ok(b) => b,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "failed to read request body"),
    };
    if body.len() > state.max_buffer_size {
        return map_error(GatewayError::BodyTooLarge(state.max_buffer_size));
    }

    match stdio_round_trip(
        &state.instance,
        &channel,
        method.as_str(),
        &path_and_query,
        sanitized_headers,
        body,
        state.max_buffer_size,
        state.request_timeout,
    )
    .await
    {
        Ok((status, value)) => (status, axum::Json(value)).into_response(),
        Err(e) => map_error(e),
    }
}

fn validate_method(method: &str) -> Result<()> {
    if ALLOWED_METHODS.contains(&method) {
        Ok(())
    } else {
        Err(GatewayError::InvalidMethod(method.to_string()))
    }
}

fn validate_url(url: &str) -> Result<()> {
    if url.is_empty() || url.len() > MAX_URL_LEN {
        return Err(GatewayError::InvalidUrl(format!("length {} out of bounds", url.len())));
    }
    if url.contains(['<', '>', '"', '\'']) {
        return Err(GatewayError::InvalidUrl("disallowed character".to_string()));
    }
    Ok(())
}

fn validate_headers(headers: &HeaderMap) -> Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for (name, value) in headers.iter() {
        let key = name.as_str().to_lowercase();
        if !ALLOWED_HEADERS.contains(&key.as_str()) {
            continue;
        }
        let Ok(raw) = value.to_str() else { continue };
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, '\r' | '\n' | '<' | '>' | '"' | '\''))
            .collect();
        let cleaned = cleaned.trim();
        if cleaned.is_empty() || cleaned.len() > MAX_HEADER_VALUE_LEN {
            continue;
        }
        out.insert(key, cleaned.to_string());
    }
    Ok(out)
}

fn cors_preflight() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-methods", "GET, POST, PUT, DELETE, PATCH, OPTIONS")
        .header("access-control-allow-headers", ALLOWED_HEADERS.join(", "))
        .body(axum::body::Body::empty())
        .unwrap()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
}

fn map_error(err: GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &err.to_string())
}

/// Run one stdio round trip: write the framed request, read the first
/// complete JSON value off stdout, translate it into an HTTP response.
///
/// `instance.stdio_lock` is what actually enforces the single-in-flight
/// invariant; the channel itself is only ever borrowed for the duration of
/// this call; a restart between calls simply hands the next call a new one.
async fn stdio_round_trip(
    instance: &AdapterInstance,
    channel: &StdioChannel,
    method: &str,
    url: &str,
    headers: HashMap<String, String>,
    body: Bytes,
    max_buffer_size: usize,
    request_timeout: Duration,
) -> Result<(StatusCode, Value)> {
    if body.len() > max_buffer_size {
        return Err(GatewayError::BodyTooLarge(max_buffer_size));
    }
    let body_str: String = String::from_utf8_lossy(&body).chars().filter(|&c| c != '\0').collect();

    let _guard = instance.stdio_lock.lock().await;

    let request = ChildRequest {
        method: method.to_string(),
        url: url.to_string(),
        headers,
        body: body_str,
    };
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');

    let fut = async {
        channel.write_line(&line).await?;

        loop {
            let Some(raw) = channel.next_line().await? else {
                return Err(GatewayError::NotRunning("adapter".to_string()));
            };
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChildReply>(trimmed) {
                Ok(reply) => return Ok(reply),
                Err(_) => continue,
            }
        }
    };

    let reply = match tokio::time::timeout(request_timeout, fut).await {
        Ok(result) => result?,
        Err(_) => {
            // The child may still write this request's reply (or unrelated
            // log lines) after we give up on it. Absorb whatever shows up
            // in a short grace window, still holding `_guard`, so the next
            // round trip on this channel can't read it as its own reply.
            drain_stale_reply(channel).await;
            return Err(GatewayError::StdioTimeout("adapter".to_string()));
        }
    };

    let status = StatusCode::from_u16(reply.status_code).unwrap_or(StatusCode::OK);
    Ok((status, reply.body))
}

/// Read and discard lines from the child's stdout for up to
/// [`STALE_REPLY_DRAIN_GRACE`], or until the stream goes quiet. Called only
/// after a round trip has already timed out, to keep a late reply from
/// being mistaken for the next request's reply.
async fn drain_stale_reply(channel: &StdioChannel) {
    let _ = tokio::time::timeout(STALE_REPLY_DRAIN_GRACE, async {
        loop {
            match channel.next_line().await {
                Ok(Some(_)) => continue,
                _ => break,
            }
        }
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_allowlist() {
        assert!(validate_method("GET").is_ok());
        assert!(validate_method("TRACE").is_err());
    }

    #[test]
    fn url_length_boundary() {
        let ok = "a".repeat(MAX_URL_LEN);
        assert!(validate_url(&ok).is_ok());
        let too_long = "a".repeat(MAX_URL_LEN + 1);
        assert!(validate_url(&too_long).is_err());
    }

    #[test]
    fn url_rejects_angle_brackets() {
        assert!(validate_url("/x?<script>").is_err());
    }

    #[test]
    fn headers_keep_only_allowlisted_keys() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("x-evil", "drop-me".parse().unwrap());
        let out = validate_headers(&headers).unwrap();
        assert!(out.contains_key("content-type"));
        assert!(!out.contains_key("x-evil"));
    }
}
