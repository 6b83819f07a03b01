//! Error types for gateway operations.

use thiserror::Error;

/// Main error type for gateway operations.
///
/// Carries one variant per taxonomy row the core's components can raise;
/// `Gateway` translates these into HTTP statuses or WebSocket close codes,
/// it never lets one escape as a process-terminating panic.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Duplicate backend name found while loading configuration.
    #[error("duplicate backend name: {0}")]
    DuplicateName(String),

    /// Invalid configuration for a named backend.
    #[error("invalid config for backend '{0}': {1}")]
    InvalidConfig(String, String),

    // --- Port Allocator (A) ---
    /// The allocator's configured range contains no free port.
    #[error("no ports available in range")]
    NoPortsAvailable,

    /// The allocator was constructed with an invalid range.
    #[error("invalid port range [{0}, {1}]")]
    InvalidPortRange(u16, u16),

    // --- Process Supervisor (B) / Stdio Adapter (C) validation ---
    /// An HTTP descriptor was asked to spawn a child process.
    #[error("backend '{0}' speaks http and cannot be spawned")]
    HttpNotSpawnable(String),

    /// A stdio descriptor has no command to spawn.
    #[error("backend '{0}' has no command configured")]
    NoCommand(String),

    /// The command's basename is not on the allowlist.
    #[error("backend '{0}': command '{1}' is not on the allowlist")]
    DisallowedCommand(String, String),

    /// The command or one of its arguments contains disallowed characters.
    #[error("backend '{0}': {1}")]
    DangerousArgs(String, String),

    /// The child did not report ready before `startupTimeout` elapsed.
    #[error("backend '{0}' did not start within the startup timeout")]
    StartupTimeout(String),

    /// The child exited while still in the `starting` state.
    #[error("backend '{0}' exited during startup: {1}")]
    ExitedDuringStartup(String, String),

    // --- Stdio Adapter (C) request handling ---
    /// The in-flight stdio round trip exceeded its deadline.
    #[error("backend '{0}' did not reply within the request timeout")]
    StdioTimeout(String),

    /// The request body exceeded the configured maximum.
    #[error("request body exceeds the {0}-byte limit")]
    BodyTooLarge(usize),

    /// The request method is not in the allowed set.
    #[error("method '{0}' is not allowed")]
    InvalidMethod(String),

    /// The request URL failed validation.
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    /// One or more request headers failed validation.
    #[error("invalid request headers: {0}")]
    InvalidHeaders(String),

    // --- Reverse Proxy (D) ---
    /// No port has been allocated for the named backend.
    #[error("no port allocated for backend '{0}'")]
    NoPortAllocated(String),

    /// The backend's process is not currently running.
    #[error("backend '{0}' is not running")]
    NotRunning(String),

    /// The upstream connection was refused.
    #[error("connection to backend '{0}' was refused")]
    ConnectionRefused(String),

    /// The upstream request timed out.
    #[error("request to backend '{0}' timed out")]
    GatewayTimeout(String),

    // --- Router (E) ---
    /// No registered backend matched the request path.
    #[error("no route matches path '{0}'")]
    NoRouteMatch(String),

    // --- WebSocket Relay (F) ---
    /// The outbound WebSocket connection to the backend failed.
    #[error("websocket connect to backend '{0}' failed: {1}")]
    WebSocketConnectFailed(String, String),

    /// The relay is already at its configured connection cap.
    #[error("websocket connection limit reached")]
    ClientLimitReached,

    /// The upgrade request path was not `/ws/<name>[/...]`.
    #[error("invalid websocket path '{0}'")]
    InvalidWsPath(String),

    /// The connection was closed for exceeding the idle timeout.
    #[error("websocket connection '{0}' idle timeout")]
    IdleTimeout(String),

    /// Wraps an I/O error from a spawn, bind, or file operation.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wraps a JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Wraps an upstream HTTP client error from the reverse proxy.
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Map this error to the HTTP status the proxy/adapter should answer
    /// with, per the failure-mapping table in the error handling design.
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::NoPortsAvailable
            | GatewayError::NoPortAllocated(_)
            | GatewayError::NotRunning(_)
            | GatewayError::ConnectionRefused(_) => 503,
            GatewayError::GatewayTimeout(_) => 504,
            GatewayError::BodyTooLarge(_) => 413,
            GatewayError::InvalidMethod(_)
            | GatewayError::InvalidUrl(_)
            | GatewayError::InvalidHeaders(_)
            | GatewayError::InvalidConfig(_, _)
            | GatewayError::DuplicateName(_) => 400,
            GatewayError::NoRouteMatch(_) => 404,
            GatewayError::StdioTimeout(_) => 504,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disallowed_command_display() {
        let err = GatewayError::DisallowedCommand("rm-it".to_string(), "rm".to_string());
        assert_eq!(err.to_string(), "backend 'rm-it': command 'rm' is not on the allowlist");
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(GatewayError::NoPortAllocated("x".into()).status_code(), 503);
        assert_eq!(GatewayError::GatewayTimeout("x".into()).status_code(), 504);
        assert_eq!(GatewayError::BodyTooLarge(10).status_code(), 413);
        assert_eq!(GatewayError::NoRouteMatch("/x".into()).status_code(), 404);
        assert_eq!(GatewayError::HttpNotSpawnable("x".into()).status_code(), 500);
    }
}
