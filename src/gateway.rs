//! Gateway (component G) — composes A–F behind one public HTTP listener.
//!
//! Construction order follows §4.G: allocator, supervisor, adapter, proxy,
//! router, relay, in that order, each wired to the shared lifecycle event
//! channel. Registering a descriptor either wires it fully (stdio, with a
//! spawnable command) or only registers it with the router (pure HTTP, or
//! a stdio descriptor with no command to spawn — e.g. waiting on an
//! externally-managed process).

use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router as AxumRouter;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::adapter::StdioHttpAdapter;
use crate::allocator::PortAllocator;
use crate::descriptor::BackendDescriptor;
use crate::error::{GatewayError, Result};
use crate::guard::RequestGuard;
use crate::logging::{log_event, noop_sink, GatewayEvent, GatewayEvents};
#[cfg(feature = "metrics")]
use crate::metrics::GatewayMetrics;
use crate::proxy::ReverseProxy;
use crate::router::{Router, RouterConfig};
use crate::supervisor::ProcessSupervisor;
use crate::ws::WebSocketRelay;

/// Feature toggles the external config loader resolves before construction.
#[derive(Debug, Clone, Copy)]
pub struct GatewayConfig {
    pub cors: bool,
    pub websocket: bool,
    #[cfg(feature = "metrics")]
    pub metrics: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cors: true,
            websocket: true,
            #[cfg(feature = "metrics")]
            metrics: true,
        }
    }
}

const SERVER_NAME: &str = "mcp-gateway";

/// Owns A–F and the public HTTP listener. The sole entry point a binary
/// (or an embedding caller) needs.
pub struct Gateway {
    config: GatewayConfig,
    started_at: Instant,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    adapter: Arc<StdioHttpAdapter>,
    proxy: Arc<ReverseProxy>,
    router: Arc<Router>,
    relay: Arc<WebSocketRelay>,
    events_sink: Arc<dyn GatewayEvents>,
    request_guard: Option<Arc<dyn RequestGuard>>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
}

impl Gateway {
    /// Build every core component and register `descriptors` with it. Fails
    /// fast on the first port-allocation or child-spawn failure a caller
    /// asks to be treated as fatal; callers that want "skip and continue"
    /// semantics for the port-exhaustion scenario should catch `register`'s
    /// error per descriptor instead of using this all-or-nothing helper.
    pub async fn new(
        config: GatewayConfig,
        port_start: u16,
        port_end: u16,
    ) -> Result<Arc<Self>> {
        Self::with_events(config, port_start, port_end, noop_sink()).await
    }

    pub async fn with_events(
        config: GatewayConfig,
        port_start: u16,
        port_end: u16,
        events_sink: Arc<dyn GatewayEvents>,
    ) -> Result<Arc<Self>> {
        Self::with_events_and_guard(config, port_start, port_end, events_sink, None).await
    }

    /// Like [`Gateway::with_events`], additionally attaching a
    /// [`RequestGuard`] consulted before every `/<name>/...` and
    /// `/ws/<name>` request. `None` (the default from every other
    /// constructor) means no policy is enforced — the core's own stance per
    /// its Non-goals.
    pub async fn with_events_and_guard(
        config: GatewayConfig,
        port_start: u16,
        port_end: u16,
        events_sink: Arc<dyn GatewayEvents>,
        request_guard: Option<Arc<dyn RequestGuard>>,
    ) -> Result<Arc<Self>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let allocator = Arc::new(PortAllocator::new(port_start, port_end)?);
        let supervisor = ProcessSupervisor::with_defaults(events_tx.clone());
        let adapter = StdioHttpAdapter::new(supervisor.clone(), events_tx.clone());
        let proxy = Arc::new(ReverseProxy::new(allocator.clone(), supervisor.clone()));
        let router = Arc::new(Router::new(RouterConfig::default()));
        let relay = WebSocketRelay::new(allocator.clone(), events_tx.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let gateway = Arc::new(Self {
            config,
            started_at: Instant::now(),
            allocator,
            supervisor,
            adapter,
            proxy,
            router,
            relay: relay.clone(),
            events_sink: events_sink.clone(),
            request_guard,
            shutdown_tx,
        });

        tokio::spawn(drain_events(events_rx, events_sink));
        tokio::spawn(relay.run_heartbeat(shutdown_rx));

        Ok(gateway)
    }

    /// Register one backend: always with the router, additionally wiring
    /// an adapter (and optionally a spawned child) for stdio backends.
    /// Matches §4.G: `requiresStdio` gets A.allocate + C.createAdapter (+
    /// B.startServer when a command is present); pure HTTP backends only
    /// register with the router.
    pub async fn register(&self, descriptor: BackendDescriptor) -> Result<()> {
        descriptor.validate()?;

        if descriptor.capabilities.requires_stdio {
            let port = self.allocator.allocate(&descriptor.name, None).await?;
            let _ = log_and_forward(&self.events_sink, GatewayEvent::PortAllocated {
                name: descriptor.name.clone(),
                port,
            });

            self.adapter
                .create_adapter(&descriptor.name, port, descriptor.command.is_some())
                .await?;

            if descriptor.command.is_some() {
                descriptor.validate_spawnable()?;
                self.supervisor.start_server(descriptor.clone(), Some(port)).await?;
            }
        }

        self.router.register(descriptor).await;
        Ok(())
    }

    /// Register every descriptor, continuing past a single failure (the
    /// port-exhaustion scenario: the gateway logs and skips the offending
    /// backend, the rest remain reachable).
    pub async fn register_all(&self, descriptors: Vec<BackendDescriptor>) {
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if let Err(e) = self.register(descriptor).await {
                tracing::warn!(backend = %name, error = %e, "failed to register backend, skipping");
            }
        }
    }

    /// Build the axum app serving the built-in endpoints, backend routes,
    /// and the `/ws/<name>` relay.
    pub fn router(self: &Arc<Self>) -> AxumRouter {
        let state = AppState { gateway: self.clone() };
        AxumRouter::new()
            .route("/", any(root_handler))
            .route("/health", any(health_handler))
            .route("/servers", any(servers_handler))
            .route("/ports", any(ports_handler))
            .route("/stats", any(stats_handler))
            .route("/metrics", any(metrics_route))
            .route("/ws/{*rest}", any(ws_handler))
            .fallback(any(dispatch_handler))
            .with_state(state)
    }

    /// Serve the public listener until `cancel` fires, then run the
    /// shutdown sequence: F.shutdown → C.stopAllAdapters → B.stopAllServers
    /// → close listener → A/B/C cleanup.
    pub async fn serve(self: &Arc<Self>, host: &str, port: u16, cancel: CancellationToken) -> Result<()> {
        let app = self.router();
        let addr = format!("{host}:{port}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(%addr, "gateway listening");

        let gw = self.clone();
        axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        gw.shutdown().await;
        Ok(())
    }

    /// Run the shutdown sequence without owning the listener (useful for
    /// embedding callers that drive their own `axum::serve`).
    pub async fn shutdown(&self) {
        tracing::info!("gateway shutting down");
        let _ = self.shutdown_tx.send(true);
        self.relay.shutdown().await;
        self.adapter.stop_all_adapters().await;
        self.supervisor.stop_all_servers().await;
        self.allocator.cleanup().await;
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn adapter(&self) -> &Arc<StdioHttpAdapter> {
        &self.adapter
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        &self.proxy
    }

    pub fn router_component(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn relay(&self) -> &Arc<WebSocketRelay> {
        &self.relay
    }
}

async fn drain_events(mut rx: mpsc::UnboundedReceiver<GatewayEvent>, sink: Arc<dyn GatewayEvents>) {
    while let Some(event) = rx.recv().await {
        log_event(&event);
        sink.on_event(&event);
    }
}

fn log_and_forward(sink: &Arc<dyn GatewayEvents>, event: GatewayEvent) {
    log_event(&event);
    sink.on_event(&event);
}

fn cors_headers() -> [(&'static str, &'static str); 3] {
    [
        ("access-control-allow-origin", "*"),
        ("access-control-allow-methods", "GET, POST, PUT, DELETE, PATCH, OPTIONS"),
        ("access-control-allow-headers", "content-type, authorization"),
    ]
}

async fn root_handler(State(state): State<AppState>, method: Method) -> Response {
    if method == Method::OPTIONS && state.gateway.config.cors {
        return cors_preflight();
    }
    let names = state.gateway.router.registered_names().await;
    let body = serde_json::json!({
        "name": SERVER_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "description": "MCP-style gateway fronting heterogeneous stdio and HTTP backends",
        "endpoints": ["/", "/health", "/servers", "/ports", "/metrics", "/stats", "/ws/<name>"],
        "servers": names,
        "features": {
            "cors": state.gateway.config.cors,
            "websocket": state.gateway.config.websocket,
        },
    });
    with_cors(state.gateway.config.cors, axum::Json(body).into_response())
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let processes = state.gateway.supervisor.all_processes().await;
    let total = processes.len();
    let failed = processes
        .iter()
        .filter(|p| p.state == crate::supervisor::ProcessState::Failed)
        .count();
    let running = processes
        .iter()
        .filter(|p| p.state == crate::supervisor::ProcessState::Running)
        .count();
    let healthy = failed == 0;
    let body = serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "timestamp": state.gateway.started_at.elapsed().as_secs(),
        "uptime": state.gateway.started_at.elapsed().as_secs(),
        "servers": { "total": total, "running": running, "failed": failed },
        "memory": memory_snapshot(),
    });
    let status = if healthy { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    with_cors(state.gateway.config.cors, (status, axum::Json(body)).into_response())
}

async fn servers_handler(State(state): State<AppState>) -> Response {
    let descriptors = state.gateway.router.all_descriptors().await;
    let mut out = Vec::with_capacity(descriptors.len());
    for d in descriptors {
        let process = state.gateway.supervisor.process_info(&d.name).await;
        let port = state.gateway.allocator.port_for_name(&d.name).await;
        out.push(serde_json::json!({
            "name": d.name,
            "protocol": d.protocol,
            "detectedType": d.detected_type,
            "capabilities": d.capabilities,
            "restart": d.restart,
            "port": port,
            "process": process,
        }));
    }
    with_cors(state.gateway.config.cors, axum::Json(out).into_response())
}

async fn ports_handler(State(state): State<AppState>) -> Response {
    state.gateway.allocator.sweep_expired_reservations().await;
    let body = serde_json::json!({
        "range": state.gateway.allocator.range_info().await,
        "allocations": state.gateway.allocator.allocations().await.iter().map(|a| serde_json::json!({
            "name": a.name, "port": a.port, "reserved": a.reserved,
        })).collect::<Vec<_>>(),
        "reservedPorts": state.gateway.allocator.reserved_ports().await,
    });
    with_cors(state.gateway.config.cors, axum::Json(body).into_response())
}

async fn stats_handler(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "uptimeMs": state.gateway.started_at.elapsed().as_millis() as u64,
        "memory": memory_snapshot(),
        "websocketConnections": state.gateway.relay.connection_count().await,
    });
    with_cors(state.gateway.config.cors, axum::Json(body).into_response())
}

async fn metrics_route(State(state): State<AppState>) -> Response {
    #[cfg(feature = "metrics")]
    {
        if !state.gateway.config.metrics {
            return with_cors(state.gateway.config.cors, StatusCode::NOT_FOUND.into_response());
        }
        let processes = state.gateway.supervisor.all_processes().await;
        let body = GatewayMetrics {
            proxy: state.gateway.proxy.aggregate_stats().await,
            ports: state.gateway.allocator.range_info().await,
            servers_total: processes.len(),
            servers_running: processes
                .iter()
                .filter(|p| p.state == crate::supervisor::ProcessState::Running)
                .count(),
            servers_failed: processes
                .iter()
                .filter(|p| p.state == crate::supervisor::ProcessState::Failed)
                .count(),
            websocket: state.gateway.relay.stats().await,
        };
        return with_cors(state.gateway.config.cors, axum::Json(body).into_response());
    }
    #[cfg(not(feature = "metrics"))]
    {
        with_cors(state.gateway.config.cors, StatusCode::NOT_FOUND.into_response())
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.gateway.config.websocket {
        return StatusCode::NOT_FOUND.into_response();
    }
    if let Some(guard) = &state.gateway.request_guard {
        if let Err(denied) = guard.check(&Method::GET, uri.path(), &headers) {
            let status = StatusCode::from_u16(denied.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
            return (status, denied.to_string()).into_response();
        }
    }
    let backend_name = match WebSocketRelay::parse_path(uri.path()) {
        Ok(name) => name,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid websocket path").into_response(),
    };
    let relay = state.gateway.relay.clone();
    ws.on_upgrade(move |socket| relay.handle_connection(backend_name, socket))
}

/// Dispatch to the router (E), falling back to a 404 listing every
/// registered backend name, matching §6's `/<anything-else>` row.
async fn dispatch_handler(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    req: Request,
) -> Response {
    if method == Method::OPTIONS && state.gateway.config.cors {
        return cors_preflight();
    }

    let uri = req.uri().clone();
    let full_path = uri.path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());

    if let Some(guard) = &state.gateway.request_guard {
        if let Err(denied) = guard.check(&method, uri.path(), &headers) {
            let status = StatusCode::from_u16(denied.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
            let body = serde_json::json!({ "error": denied.to_string() });
            return with_cors(state.gateway.config.cors, (status, axum::Json(body)).into_response());
        }
    }

    let Some(route_match) = state.gateway.router.route_request(&full_path).await else {
        let names = state.gateway.router.registered_names().await;
        let body = serde_json::json!({
            "error": "no route matches this path",
            "servers": names,
        });
        return with_cors(state.gateway.config.cors, (StatusCode::NOT_FOUND, axum::Json(body)).into_response());
    };

    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(_) => return with_cors(state.gateway.config.cors, StatusCode::BAD_REQUEST.into_response()),
    };

    match state
        .gateway
        .proxy
        .forward(&route_match.descriptor, method, &route_match.target_path, headers, body)
        .await
    {
        Ok((status, resp_headers, resp_body)) => {
            let mut response = Response::builder().status(status);
            for (name, value) in resp_headers.iter() {
                response = response.header(name, value);
            }
            let response = response.body(Body::from(resp_body)).unwrap_or_else(|_| {
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            });
            with_cors(state.gateway.config.cors, response)
        }
        Err(e) => with_cors(state.gateway.config.cors, map_proxy_error(e)),
    }
}

fn map_proxy_error(err: GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}

fn cors_preflight() -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    for (k, v) in cors_headers() {
        builder = builder.header(k, v);
    }
    builder.body(Body::empty()).unwrap()
}

fn with_cors(enabled: bool, mut response: Response) -> Response {
    if enabled {
        for (k, v) in cors_headers() {
            response.headers_mut().insert(k, v.parse().unwrap());
        }
    }
    response
}

/// Best-effort process memory snapshot; not available on every platform,
/// so a missing reading degrades to `null` rather than failing the request.
fn memory_snapshot() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().unwrap_or(0);
                    return serde_json::json!({ "rssBytes": kb * 1024 });
                }
            }
        }
    }
    serde_json::Value::Null
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DetectedType, Protocol};
    use std::collections::HashMap;

    fn http_descriptor(name: &str, url: &str) -> BackendDescriptor {
        BackendDescriptor::new(
            name,
            Protocol::Http,
            DetectedType::Http,
            None,
            vec![],
            HashMap::new(),
            Some(url.to_string()),
            false,
            None,
        )
    }

    #[tokio::test]
    async fn http_backend_registers_with_router_only() {
        let gw = Gateway::new(GatewayConfig::default(), 15001, 15010).await.unwrap();
        gw.register(http_descriptor("echo", "http://127.0.0.1:9101")).await.unwrap();
        assert_eq!(gw.allocator.port_for_name("echo").await, None);
        assert_eq!(gw.router.registered_names().await, vec!["echo".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_name_registration_is_rejected_by_loader_not_gateway() {
        // The gateway itself doesn't de-duplicate; that's the config loader's
        // job (see config.rs::validate). Registering the same name twice
        // simply overwrites the router entry — verify that doesn't panic.
        let gw = Gateway::new(GatewayConfig::default(), 15101, 15110).await.unwrap();
        gw.register(http_descriptor("svc", "http://127.0.0.1:9101")).await.unwrap();
        gw.register(http_descriptor("svc", "http://127.0.0.1:9102")).await.unwrap();
        let d = gw.router.descriptor("svc").await.unwrap();
        assert_eq!(d.url.as_deref(), Some("http://127.0.0.1:9102"));
    }

    #[tokio::test]
    async fn health_reports_healthy_with_no_backends() {
        let gw = Gateway::new(GatewayConfig::default(), 15201, 15210).await.unwrap();
        let processes = gw.supervisor.all_processes().await;
        assert!(processes.is_empty());
    }

    fn stdio_descriptor(name: &str) -> BackendDescriptor {
        // command-less: exercises the allocator/router path without
        // spawning a child (see DESIGN.md's "command-less stdio adapters").
        BackendDescriptor::new(
            name,
            Protocol::Stdio,
            DetectedType::Custom,
            None,
            vec![],
            HashMap::new(),
            None,
            false,
            None,
        )
    }

    /// §8 scenario 4: range `[start, start+1]`, three stdio backends — the
    /// third allocation fails, the gateway skips it via `register_all`, the
    /// first two remain reachable (registered with the router and holding a
    /// port).
    #[tokio::test]
    async fn port_exhaustion_skips_third_backend_others_remain_reachable() {
        let gw = Gateway::new(GatewayConfig::default(), 16001, 16002).await.unwrap();
        gw.register_all(vec![
            stdio_descriptor("one"),
            stdio_descriptor("two"),
            stdio_descriptor("three"),
        ])
        .await;

        assert!(gw.allocator.port_for_name("one").await.is_some());
        assert!(gw.allocator.port_for_name("two").await.is_some());
        assert!(gw.allocator.port_for_name("three").await.is_none());

        // The router only gets a registration once a descriptor clears
        // allocation: `register` returns before calling `router.register`
        // when `allocator.allocate` fails, so "three" was never registered.
        let names = gw.router.registered_names().await;
        assert!(names.contains(&"one".to_string()));
        assert!(names.contains(&"two".to_string()));
        assert!(!names.contains(&"three".to_string()));
    }

    /// §8 scenario 1: an HTTP backend that echoes back the path and query
    /// it received. `GET /echo/hi?x=1` should reach it as `path=/hi`,
    /// `query=x=1`, with the response relayed back to the client untouched.
    #[tokio::test]
    async fn http_backend_round_trips_path_and_query() {
        let echo_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo_listener.local_addr().unwrap();
        let echo_app = AxumRouter::new().fallback(any(|req: Request| async move {
            let path = req.uri().path().to_string();
            let query = req.uri().query().unwrap_or("").to_string();
            axum::Json(serde_json::json!({ "path": path, "query": query }))
        }));
        tokio::spawn(async move {
            let _ = axum::serve(echo_listener, echo_app.into_make_service()).await;
        });

        let gw = Gateway::new(GatewayConfig::default(), 16101, 16110).await.unwrap();
        gw.register(http_descriptor("echo", &format!("http://{echo_addr}")))
            .await
            .unwrap();

        let app = gw.router();
        let client_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(client_listener, app.into_make_service()).await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let resp = reqwest::get(format!("http://{client_addr}/echo/hi?x=1")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["path"], "/hi");
        assert_eq!(body["query"], "x=1");
    }

    /// Scenarios that need a real external process (`node`) on `PATH` — the
    /// stdio happy path, crash/restart, and websocket relay. Gated the same
    /// way the teacher gates its own real-binary discovery tests.
    #[cfg(all(test, feature = "integration-tests"))]
    mod integration {
        use super::*;
        use std::time::Duration;

        fn node_descriptor(name: &str, script: &str, restart: bool) -> BackendDescriptor {
            BackendDescriptor::new(
                name,
                Protocol::Stdio,
                DetectedType::Custom,
                Some("node".to_string()),
                vec!["-e".to_string(), script.to_string()],
                HashMap::new(),
                None,
                restart,
                None,
            )
        }

        /// §8 scenario 2: a stdio backend that echoes its stdin line back on
        /// stdout. The adapter reads that line back as the reply, defaulting
        /// `statusCode` to 200 since the echoed request carries none.
        #[tokio::test]
        async fn stdio_backend_round_trips_through_child() {
            let gw = Gateway::new(GatewayConfig::default(), 16201, 16210).await.unwrap();
            gw.register(node_descriptor(
                "mem",
                r#"
                process.stdin.on('data', d => {
                    const req = JSON.parse(d.toString());
                    const reply = { status_code: 200, body: { method: req.method, url: req.url } };
                    process.stdout.write(JSON.stringify(reply) + '\n');
                });
                "#,
                false,
            ))
            .await
            .unwrap();

            let port = gw.allocator.port_for_name("mem").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;

            let resp = reqwest::Client::new()
                .post(format!("http://127.0.0.1:{port}/ping"))
                .body("{}")
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), reqwest::StatusCode::OK);
            let body: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(body["method"], "POST");
            assert_eq!(body["url"], "/ping");
        }

        /// §8 scenario 3: a child that exits quickly with `restart: true`.
        /// After `maxRestarts` restarts the record settles into `failed` and
        /// stays there until a manual `restartServer`.
        #[tokio::test]
        async fn crashing_backend_exhausts_restarts_and_settles_failed() {
            let (tx, _rx) = mpsc::unbounded_channel();
            let sup = crate::supervisor::ProcessSupervisor::new(
                crate::supervisor::SupervisorConfig {
                    max_restarts: 2,
                    restart_delay: Duration::from_millis(50),
                    startup_timeout: Duration::from_secs(5),
                    shutdown_timeout: Duration::from_secs(5),
                },
                tx,
            );
            let descriptor = node_descriptor("flaky", "process.exit(1)", true);
            sup.start_server(descriptor.clone(), None).await.unwrap();

            // 1 initial run + 2 restarts, each needing time to spawn, exit,
            // and back off before the next attempt.
            tokio::time::sleep(Duration::from_secs(2)).await;

            let info = sup.process_info("flaky").await.unwrap();
            assert_eq!(info.state, crate::supervisor::ProcessState::Failed);
            assert_eq!(info.restart_count, 2);
        }

        /// §8 scenario 6: ten text frames round-trip in order through a
        /// backend that echoes every frame it receives.
        #[tokio::test]
        async fn websocket_relay_round_trips_frames_in_order() {
            let gw = Gateway::new(GatewayConfig::default(), 16301, 16310).await.unwrap();
            gw.register(node_descriptor(
                "wsecho",
                r#"
                const http = require('http');
                const crypto = require('crypto');
                const srv = http.createServer();
                srv.on('upgrade', (req, sock) => {
                    const key = req.headers['sec-websocket-key'];
                    const accept = crypto
                        .createHash('sha1')
                        .update(key + '258EAFA5-E914-47DA-95CA-C5AB0DC85B11')
                        .digest('base64');
                    sock.write(
                        'HTTP/1.1 101 Switching Protocols\r\n' +
                        'Upgrade: websocket\r\n' +
                        'Connection: Upgrade\r\n' +
                        'Sec-WebSocket-Accept: ' + accept + '\r\n\r\n'
                    );
                    sock.on('data', d => sock.write(d));
                });
                srv.listen(process.env.PORT);
                "#,
                false,
            ))
            .await
            .unwrap();

            tokio::time::sleep(Duration::from_millis(300)).await;

            let app = gw.router();
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                let _ = axum::serve(listener, app.into_make_service()).await;
            });
            tokio::time::sleep(Duration::from_millis(50)).await;

            let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws/wsecho"))
                .await
                .unwrap();

            use futures_util::{SinkExt, StreamExt};
            for i in 0..10u32 {
                let text = format!("frame-{i}");
                ws.send(tokio_tungstenite::tungstenite::Message::Text(text.clone().into()))
                    .await
                    .unwrap();
                let reply = ws.next().await.unwrap().unwrap();
                assert_eq!(reply.into_text().unwrap(), text);
            }
        }
    }
}
