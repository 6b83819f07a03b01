//! Request guard hook point — the "hook points, not policy" collaborator
//! `spec.md` §1 calls out for authentication and rate limiting.
//!
//! The core ships no auth/rate-limit implementation; it only exposes a
//! synchronous trait a caller can implement and hand to `Gateway` so every
//! request is checked before routing. Modeled on the teacher's
//! `AccessGuard` (`cli/access_guard.rs`): a plain, synchronous `check`
//! method rather than an async trait, since the decision itself needs no
//! I/O — a caller backing it with a remote policy service can cache
//! whatever it needs inside its own implementation.

use axum::http::{HeaderMap, Method};
use std::fmt;

/// Why a [`RequestGuard`] refused a request.
#[derive(Debug, Clone)]
pub enum GuardDenied {
    /// Missing or invalid credentials.
    Unauthorized(String),
    /// Caller is over its configured rate limit.
    RateLimited(String),
}

impl fmt::Display for GuardDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardDenied::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            GuardDenied::RateLimited(msg) => write!(f, "rate limited: {msg}"),
        }
    }
}

impl GuardDenied {
    pub fn status_code(&self) -> u16 {
        match self {
            GuardDenied::Unauthorized(_) => 401,
            GuardDenied::RateLimited(_) => 429,
        }
    }
}

/// A policy a caller can attach to [`crate::gateway::Gateway`] to reject a
/// request before it reaches the router. The core never implements one
/// itself; built-in endpoints (`/health`, `/ports`, ...) are never checked,
/// only the routed `/<name>/...` and `/ws/<name>` surfaces.
pub trait RequestGuard: Send + Sync {
    fn check(&self, method: &Method, path: &str, headers: &HeaderMap) -> Result<(), GuardDenied>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DenyAll;
    impl RequestGuard for DenyAll {
        fn check(&self, _method: &Method, _path: &str, _headers: &HeaderMap) -> Result<(), GuardDenied> {
            Err(GuardDenied::Unauthorized("no credentials accepted in this test".into()))
        }
    }

    #[test]
    fn guard_denied_status_codes() {
        assert_eq!(GuardDenied::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(GuardDenied::RateLimited("x".into()).status_code(), 429);
    }

    #[test]
    fn a_guard_can_reject_every_request() {
        let guard = DenyAll;
        let headers = HeaderMap::new();
        assert!(guard.check(&Method::GET, "/echo/x", &headers).is_err());
    }
}
