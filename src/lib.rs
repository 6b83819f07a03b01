//! mcp-gateway — fronts heterogeneous stdio and HTTP MCP-style backends
//! through one public HTTP listener, allocating loopback ports for stdio
//! children and relaying WebSocket traffic alongside the reverse-proxied
//! request path.

pub mod adapter;
pub mod allocator;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod logging;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod proxy;
pub mod router;
pub mod supervisor;
pub mod ws;

pub use config::{load as load_config, GatewayConfigFile};
pub use descriptor::{
    BackendDescriptor, Capabilities, DetectedType, HealthCheckConfig, Protocol,
};
pub use error::{GatewayError, Result};
pub use gateway::{Gateway, GatewayConfig};
pub use guard::{GuardDenied, RequestGuard};
pub use logging::{GatewayEvent, GatewayEvents};
