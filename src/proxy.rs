//! Reverse Proxy (component D) — forwards a client request either to a
//! backend's declared URL (HTTP descriptors) or to its adapter's loopback
//! port (stdio descriptors), mapping upstream failures to gateway statuses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use reqwest::Client;
use tokio::sync::RwLock;

use crate::allocator::PortAllocator;
use crate::descriptor::{BackendDescriptor, Protocol};
use crate::error::{GatewayError, Result};
use crate::supervisor::{ProcessState, ProcessSupervisor};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-backend and aggregate counters.
#[derive(Debug, Default)]
struct BackendCounters {
    total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    total_response_ms: AtomicU64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProxyStats {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_response_ms: f64,
}

/// Forwards requests to backends; owns only its counters.
pub struct ReverseProxy {
    client: Client,
    allocator: Arc<PortAllocator>,
    supervisor: Arc<ProcessSupervisor>,
    counters: RwLock<HashMap<String, BackendCounters>>,
}

impl ReverseProxy {
    pub fn new(allocator: Arc<PortAllocator>, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            client: Client::builder()
                .timeout(UPSTREAM_TIMEOUT)
                .build()
                .expect("reqwest client builds with static config"),
            allocator,
            supervisor,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Forward `(method, path, headers, body)` to `descriptor`, returning
    /// the upstream status/headers/body or a mapped failure.
    pub async fn forward(
        &self,
        descriptor: &BackendDescriptor,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        self.bump_total(&descriptor.name).await;
        let start = Instant::now();

        let target = self.resolve_target(descriptor, path_and_query).await;
        let target = match target {
            Ok(t) => t,
            Err(e) => {
                self.bump_failure(&descriptor.name).await;
                return Err(e);
            }
        };

        let result = self.send(method, &target, headers, body).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.bump_success(&descriptor.name, elapsed_ms).await,
            Err(_) => self.bump_failure(&descriptor.name).await,
        }
        result
    }

    async fn resolve_target(&self, descriptor: &BackendDescriptor, path_and_query: &str) -> Result<String> {
        match descriptor.protocol {
            Protocol::Http => {
                let base = descriptor
                    .url
                    .as_ref()
                    .ok_or_else(|| GatewayError::InvalidConfig(descriptor.name.clone(), "missing url".into()))?;
                Ok(join_url(base, path_and_query))
            }
            Protocol::Stdio => {
                let port = self
                    .allocator
                    .port_for_name(&descriptor.name)
                    .await
                    .ok_or_else(|| GatewayError::NoPortAllocated(descriptor.name.clone()))?;
                let info = self.supervisor.process_info(&descriptor.name).await;
                match info {
                    Some(i) if i.state == ProcessState::Running => {
                        Ok(format!("http://127.0.0.1:{port}{path_and_query}"))
                    }
                    _ => Err(GatewayError::NotRunning(descriptor.name.clone())),
                }
            }
        }
    }

    async fn send(
        &self,
        method: Method,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, HeaderMap, Bytes)> {
        let mut req = self.client.request(method, target);
        for (name, value) in headers.iter() {
            if name == axum::http::header::HOST {
                continue;
            }
            req = req.header(name, value);
        }
        req = req.body(body);

        let response = req.send().await.map_err(map_reqwest_error)?;
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

        let mut out_headers = HeaderMap::new();
        for (name, value) in response.headers().iter() {
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out_headers.insert(n, v);
            }
        }
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        Ok((status, out_headers, body))
    }

    async fn bump_total(&self, name: &str) {
        let mut counters = self.counters.write().await;
        counters.entry(name.to_string()).or_default().total.fetch_add(1, Ordering::Relaxed);
    }

    async fn bump_success(&self, name: &str, elapsed_ms: u64) {
        let counters = self.counters.read().await;
        if let Some(c) = counters.get(name) {
            c.successes.fetch_add(1, Ordering::Relaxed);
            c.total_response_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        }
    }

    async fn bump_failure(&self, name: &str) {
        let counters = self.counters.read().await;
        if let Some(c) = counters.get(name) {
            c.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub async fn stats_for(&self, name: &str) -> Option<ProxyStats> {
        let counters = self.counters.read().await;
        counters.get(name).map(|c| {
            let total = c.total.load(Ordering::Relaxed);
            let successes = c.successes.load(Ordering::Relaxed);
            let response_total = c.total_response_ms.load(Ordering::Relaxed);
            ProxyStats {
                total,
                successes,
                failures: c.failures.load(Ordering::Relaxed),
                average_response_ms: if successes > 0 {
                    response_total as f64 / successes as f64
                } else {
                    0.0
                },
            }
        })
    }

    pub async fn aggregate_stats(&self) -> ProxyStats {
        let counters = self.counters.read().await;
        let mut total = 0;
        let mut successes = 0;
        let mut failures = 0;
        let mut response_total = 0;
        for c in counters.values() {
            total += c.total.load(Ordering::Relaxed);
            successes += c.successes.load(Ordering::Relaxed);
            failures += c.failures.load(Ordering::Relaxed);
            response_total += c.total_response_ms.load(Ordering::Relaxed);
        }
        ProxyStats {
            total,
            successes,
            failures,
            average_response_ms: if successes > 0 { response_total as f64 / successes as f64 } else { 0.0 },
        }
    }
}

fn join_url(base: &str, path_and_query: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path_and_query)
}

fn map_reqwest_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::GatewayTimeout(err.url().map(|u| u.to_string()).unwrap_or_default())
    } else if err.is_connect() {
        GatewayError::ConnectionRefused(err.url().map(|u| u.to_string()).unwrap_or_default())
    } else {
        GatewayError::Http(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_avoids_double_slash() {
        assert_eq!(join_url("http://localhost:9101/", "/hi?x=1"), "http://localhost:9101/hi?x=1");
        assert_eq!(join_url("http://localhost:9101", "/hi?x=1"), "http://localhost:9101/hi?x=1");
    }

    #[tokio::test]
    async fn resolve_target_requires_port_for_stdio() {
        let allocator = Arc::new(PortAllocator::new(14001, 14010).unwrap());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let supervisor = ProcessSupervisor::with_defaults(tx);
        let proxy = ReverseProxy::new(allocator, supervisor);
        let descriptor = BackendDescriptor::new(
            "mem",
            Protocol::Stdio,
            crate::descriptor::DetectedType::Custom,
            Some("node".into()),
            vec![],
            HashMap::new(),
            None,
            false,
            None,
        );
        let err = proxy.resolve_target(&descriptor, "/x").await.unwrap_err();
        assert!(matches!(err, GatewayError::NoPortAllocated(_)));
    }
}
