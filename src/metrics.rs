//! Aggregate counters surfaced by the `/metrics` built-in endpoint.
//!
//! Gated behind the `metrics` feature per the external interfaces table —
//! when the feature is off, `Gateway` simply never mounts the route.

use serde::Serialize;

use crate::allocator::RangeInfo;
use crate::proxy::ProxyStats;
use crate::ws::RelayStats;

#[derive(Debug, Serialize)]
pub struct GatewayMetrics {
    pub proxy: ProxyStats,
    pub ports: RangeInfo,
    pub servers_total: usize,
    pub servers_running: usize,
    pub servers_failed: usize,
    pub websocket: RelayStats,
}
