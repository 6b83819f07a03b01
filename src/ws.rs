//! WebSocket Relay (component F) — accepts a client WebSocket on
//! `/ws/<name>`, opens a matching connection to the backend's loopback
//! port, and pipes frames both ways with heartbeats.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;

use crate::allocator::PortAllocator;
use crate::error::{GatewayError, Result};
use crate::logging::GatewayEvent;

const DEFAULT_MAX_CONNECTIONS: usize = 1000;
const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(60);

pub const CLOSE_INVALID_PATH: u16 = 1003;
pub const CLOSE_LIMIT_REACHED: u16 = 1008;
pub const CLOSE_IDLE_TIMEOUT: u16 = 1001;
pub const CLOSE_CONNECT_FAILED: u16 = 1011;

struct ConnectionRecord {
    backend_name: String,
    last_activity: Mutex<Instant>,
    close_tx: mpsc::Sender<(u16, String)>,
    ping_tx: mpsc::Sender<()>,
}

/// Aggregate counters surfaced by `/metrics`/`/stats`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelayStats {
    pub total_ever: u64,
    pub active: usize,
    pub by_server: HashMap<String, usize>,
}

/// Owns the live WebSocket connections the relay is bridging.
pub struct WebSocketRelay {
    allocator: Arc<PortAllocator>,
    connections: RwLock<HashMap<String, Arc<ConnectionRecord>>>,
    counter: AtomicU64,
    total_ever: AtomicU64,
    max_connections: usize,
    ping_interval: Duration,
    connection_timeout: Duration,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl WebSocketRelay {
    pub fn new(allocator: Arc<PortAllocator>, events: mpsc::UnboundedSender<GatewayEvent>) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            connections: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
            total_ever: AtomicU64::new(0),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            ping_interval: DEFAULT_PING_INTERVAL,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            events,
        })
    }

    /// Parse `/ws/<name>[/...]`, returning the backend name.
    pub fn parse_path(path: &str) -> Result<String> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 || segments[0] != "ws" || segments[1].is_empty() {
            return Err(GatewayError::InvalidWsPath(path.to_string()));
        }
        Ok(segments[1].to_string())
    }

    /// Drive one accepted client socket for the given backend name. Runs
    /// until either side closes.
    pub async fn handle_connection(self: Arc<Self>, backend_name: String, client: WebSocket) {
        {
            let connections = self.connections.read().await;
            if connections.len() >= self.max_connections {
                drop(connections);
                let mut client = client;
                let _ = client
                    .send(AxumMessage::Close(Some(CloseFrame {
                        code: CLOSE_LIMIT_REACHED,
                        reason: "Connection limit reached".into(),
                    })))
                    .await;
                return;
            }
        }

        let Some(port) = self.allocator.port_for_name(&backend_name).await else {
            let mut client = client;
            let _ = client
                .send(AxumMessage::Close(Some(CloseFrame {
                    code: CLOSE_CONNECT_FAILED,
                    reason: "backend has no allocated port".into(),
                })))
                .await;
            return;
        };

        let backend_url = format!("ws://127.0.0.1:{port}/ws");
        let backend_stream = match tokio::time::timeout(
            self.connection_timeout,
            tokio_tungstenite::connect_async(&backend_url),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            _ => {
                let mut client = client;
                let _ = client
                    .send(AxumMessage::Close(Some(CloseFrame {
                        code: CLOSE_CONNECT_FAILED,
                        reason: "backend connect failed".into(),
                    })))
                    .await;
                return;
            }
        };

        let connection_id = format!(
            "ws-{}-{}",
            self.counter.fetch_add(1, Ordering::Relaxed),
            self.total_ever.load(Ordering::Relaxed)
        );
        self.total_ever.fetch_add(1, Ordering::Relaxed);

        let (close_tx, mut close_rx) = mpsc::channel::<(u16, String)>(1);
        let (ping_tx, mut ping_rx) = mpsc::channel::<()>(1);
        let record = Arc::new(ConnectionRecord {
            backend_name: backend_name.clone(),
            last_activity: Mutex::new(Instant::now()),
            close_tx,
            ping_tx,
        });
        self.connections.write().await.insert(connection_id.clone(), record.clone());
        let _ = self.events.send(GatewayEvent::WsOpened {
            connection_id: connection_id.clone(),
            backend: backend_name.clone(),
        });

        let (mut client_tx, mut client_rx) = client.split();
        let (mut backend_tx, mut backend_rx) = backend_stream.split();

        // One task driving both directions, the close signal, and heartbeat
        // pings — a single `select!` arm resolving would otherwise end the
        // whole relay the first time the heartbeat fires. `final_code`
        // records whichever side actually closed the connection (or the
        // server-initiated reason from `close_rx`), surfaced on `WsClosed`.
        let mut final_code: u16 = 1000;
        loop {
            tokio::select! {
                msg = client_rx.next() => {
                    match msg {
                        Some(Ok(AxumMessage::Close(frame))) => {
                            *record.last_activity.lock().await = Instant::now();
                            let (code, reason) = axum_close_info(frame);
                            final_code = code;
                            let _ = backend_tx
                                .send(TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
                                    code: CloseCode::from(code),
                                    reason: reason.into(),
                                })))
                                .await;
                            break;
                        }
                        Some(Ok(msg)) => {
                            *record.last_activity.lock().await = Instant::now();
                            match axum_to_tungstenite(msg) {
                                Some(out) if backend_tx.send(out).await.is_ok() => {}
                                _ => break,
                            }
                        }
                        _ => {
                            // Client stream ended without a close frame
                            // (EOF or protocol error) — tell the backend
                            // the pipe is going away instead of just
                            // dropping its sink.
                            let _ = backend_tx.send(TungsteniteMessage::Close(None)).await;
                            break;
                        }
                    }
                }
                msg = backend_rx.next() => {
                    match msg {
                        Some(Ok(TungsteniteMessage::Close(frame))) => {
                            *record.last_activity.lock().await = Instant::now();
                            let (code, reason) = tungstenite_close_info(frame);
                            final_code = code;
                            let _ = client_tx
                                .send(AxumMessage::Close(Some(CloseFrame { code, reason: reason.into() })))
                                .await;
                            break;
                        }
                        Some(Ok(msg)) => {
                            *record.last_activity.lock().await = Instant::now();
                            match tungstenite_to_axum(msg) {
                                Some(out) if client_tx.send(out).await.is_ok() => {}
                                _ => break,
                            }
                        }
                        _ => {
                            let _ = client_tx.send(AxumMessage::Close(None)).await;
                            break;
                        }
                    }
                }
                Some(()) = ping_rx.recv() => {
                    if client_tx.send(AxumMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                Some((code, reason)) = close_rx.recv() => {
                    final_code = code;
                    let _ = client_tx
                        .send(AxumMessage::Close(Some(CloseFrame { code, reason: reason.clone().into() })))
                        .await;
                    let _ = backend_tx
                        .send(TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }

        self.connections.write().await.remove(&connection_id);
        let _ = self.events.send(GatewayEvent::WsClosed {
            connection_id,
            backend: backend_name,
            code: final_code,
        });
    }

    /// Periodic task: close idle connections, ping the rest. Intended to be
    /// spawned once by the gateway and cancelled at shutdown.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.ping_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            let connections = self.connections.read().await;
            for record in connections.values() {
                let idle = record.last_activity.lock().await.elapsed();
                if idle > self.connection_timeout {
                    let _ = record.close_tx.try_send((CLOSE_IDLE_TIMEOUT, "Connection timeout".to_string()));
                } else {
                    let _ = record.ping_tx.try_send(());
                }
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connections_by_server(&self, name: &str) -> usize {
        self.connections
            .read()
            .await
            .values()
            .filter(|c| c.backend_name == name)
            .count()
    }

    pub async fn stats(&self) -> RelayStats {
        let connections = self.connections.read().await;
        let mut by_server = HashMap::new();
        for record in connections.values() {
            *by_server.entry(record.backend_name.clone()).or_insert(0) += 1;
        }
        RelayStats {
            total_ever: self.total_ever.load(Ordering::Relaxed),
            active: connections.len(),
            by_server,
        }
    }

    /// Close every active connection with 1001 and drop them.
    pub async fn shutdown(&self) {
        let connections = self.connections.read().await;
        for record in connections.values() {
            let _ = record.close_tx.try_send((CLOSE_IDLE_TIMEOUT, "Server shutdown".to_string()));
        }
        drop(connections);
        // give pipes a moment to observe the close signal before the map is cleared.
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.connections.write().await.clear();
    }
}

fn axum_to_tungstenite(msg: AxumMessage) -> Option<TungsteniteMessage> {
    match msg {
        AxumMessage::Text(t) => Some(TungsteniteMessage::Text(t.as_str().into())),
        AxumMessage::Binary(b) => Some(TungsteniteMessage::Binary(b.into())),
        AxumMessage::Ping(p) => Some(TungsteniteMessage::Ping(p.into())),
        AxumMessage::Pong(p) => Some(TungsteniteMessage::Pong(p.into())),
        AxumMessage::Close(_) => None,
    }
}

fn tungstenite_to_axum(msg: TungsteniteMessage) -> Option<AxumMessage> {
    match msg {
        TungsteniteMessage::Text(t) => Some(AxumMessage::Text(t.as_str().to_string().into())),
        TungsteniteMessage::Binary(b) => Some(AxumMessage::Binary(b.into())),
        TungsteniteMessage::Ping(p) => Some(AxumMessage::Ping(p.into())),
        TungsteniteMessage::Pong(p) => Some(AxumMessage::Pong(p.into())),
        TungsteniteMessage::Close(_) | TungsteniteMessage::Frame(_) => None,
    }
}

/// Pull the close code/reason out of an inbound axum close frame, falling
/// back to a normal closure if the peer sent none.
fn axum_close_info(frame: Option<CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code, f.reason.to_string()),
        None => (1000, String::new()),
    }
}

/// Mirror of [`axum_close_info`] for the backend-side tungstenite frame.
fn tungstenite_close_info(frame: Option<TungsteniteCloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (u16::from(f.code), f.reason.to_string()),
        None => (1000, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_path_requires_ws_prefix_and_name() {
        assert_eq!(WebSocketRelay::parse_path("/ws/echo").unwrap(), "echo");
        assert_eq!(WebSocketRelay::parse_path("/ws/echo/extra").unwrap(), "echo");
        assert!(WebSocketRelay::parse_path("/ws").is_err());
        assert!(WebSocketRelay::parse_path("/other/echo").is_err());
    }

    #[tokio::test]
    async fn stats_start_empty() {
        let allocator = Arc::new(PortAllocator::with_defaults());
        let (tx, _rx) = mpsc::unbounded_channel();
        let relay = WebSocketRelay::new(allocator, tx);
        let stats = relay.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.total_ever, 0);
    }
}
