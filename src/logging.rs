//! Lifecycle events and the sink trait the gateway drains them into.
//!
//! Every component that produces a lifecycle-relevant event (A/B/C/F) sends
//! a [`GatewayEvent`] on a shared `mpsc::UnboundedSender`; `Gateway` owns the
//! receiver, logs each event through `tracing`, and forwards a clone to an
//! optional injected [`GatewayEvents`] sink. This keeps "what to do with an
//! event" out of the components themselves.

use std::sync::Arc;

/// A lifecycle-relevant occurrence inside the gateway's managed components.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    PortAllocated { name: String, port: u16 },
    PortReleased { name: String },
    ServerStarted { name: String },
    ServerStopped { name: String, reason: String },
    ServerCrashed { name: String },
    AdapterReady { name: String, port: u16 },
    AdapterStopped { name: String },
    WsOpened { connection_id: String, backend: String },
    WsClosed { connection_id: String, backend: String, code: u16 },
}

/// A sink a caller can inject to observe gateway lifecycle events without
/// scraping log lines. The default implementation does nothing.
pub trait GatewayEvents: Send + Sync {
    fn on_event(&self, event: &GatewayEvent);
}

/// The default sink: observes nothing.
pub struct NoopEvents;

impl GatewayEvents for NoopEvents {
    fn on_event(&self, _event: &GatewayEvent) {}
}

pub fn noop_sink() -> Arc<dyn GatewayEvents> {
    Arc::new(NoopEvents)
}

/// Log `event` at a level appropriate to its severity.
pub fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::PortAllocated { name, port } => {
            tracing::debug!(backend = %name, port, "port allocated");
        }
        GatewayEvent::PortReleased { name } => {
            tracing::debug!(backend = %name, "port released");
        }
        GatewayEvent::ServerStarted { name } => {
            tracing::info!(backend = %name, "server started");
        }
        GatewayEvent::ServerStopped { name, reason } => {
            tracing::info!(backend = %name, reason = %reason, "server stopped");
        }
        GatewayEvent::ServerCrashed { name } => {
            tracing::warn!(backend = %name, "server crashed");
        }
        GatewayEvent::AdapterReady { name, port } => {
            tracing::debug!(backend = %name, port, "adapter ready");
        }
        GatewayEvent::AdapterStopped { name } => {
            tracing::debug!(backend = %name, "adapter stopped");
        }
        GatewayEvent::WsOpened { connection_id, backend } => {
            tracing::debug!(connection_id = %connection_id, backend = %backend, "websocket opened");
        }
        GatewayEvent::WsClosed { connection_id, backend, code } => {
            tracing::debug!(connection_id = %connection_id, backend = %backend, code, "websocket closed");
        }
    }
}
