//! Router (component E) — matches an incoming request path to a registered
//! backend by its first path segment, strips the prefix, and hands off to
//! the reverse proxy.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::descriptor::BackendDescriptor;

/// Routing configuration; all three default to the behaviour spec.md calls
/// out as the default.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub strip_server_prefix: bool,
    pub case_sensitive: bool,
    pub enable_wildcards: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strip_server_prefix: true,
            case_sensitive: true,
            enable_wildcards: true,
        }
    }
}

/// The result of successfully matching a request to a backend.
pub struct RouteMatch {
    pub descriptor: BackendDescriptor,
    pub target_path: String,
}

/// Owns the `name -> descriptor` map.
pub struct Router {
    config: RouterConfig,
    servers: RwLock<HashMap<String, BackendDescriptor>>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RouterConfig::default())
    }

    pub async fn register(&self, descriptor: BackendDescriptor) {
        let key = self.normalize(&descriptor.name);
        self.servers.write().await.insert(key, descriptor);
    }

    pub async fn unregister(&self, name: &str) {
        self.servers.write().await.remove(&self.normalize(name));
    }

    fn normalize(&self, name: &str) -> String {
        if self.config.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    }

    /// Match `full_path` (e.g. `/echo/hi?x=1`) against the registered
    /// backend set. Returns `None` when nothing matches.
    pub async fn route_request(&self, full_path: &str) -> Option<RouteMatch> {
        let (path, query) = match full_path.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (full_path, None),
        };
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let first = segments.first()?;
        let lookup_key = self.normalize(first);

        let servers = self.servers.read().await;
        let descriptor = match servers.get(&lookup_key) {
            Some(d) => d.clone(),
            None if self.config.enable_wildcards => {
                servers
                    .iter()
                    .find(|(pattern, _)| pattern.contains('*') && glob_match(pattern, &lookup_key))
                    .map(|(_, d)| d.clone())?
            }
            None => return None,
        };
        drop(servers);

        let target_path = if self.config.strip_server_prefix {
            let rest = segments[1..].join("/");
            format!("/{rest}")
        } else {
            path.to_string()
        };

        let target_path = match query {
            Some(q) => format!("{target_path}?{q}"),
            None => target_path,
        };

        Some(RouteMatch { descriptor, target_path })
    }

    pub async fn registered_names(&self) -> Vec<String> {
        self.servers.read().await.keys().cloned().collect()
    }

    pub async fn descriptor(&self, name: &str) -> Option<BackendDescriptor> {
        self.servers.read().await.get(&self.normalize(name)).cloned()
    }

    pub async fn all_descriptors(&self) -> Vec<BackendDescriptor> {
        self.servers.read().await.values().cloned().collect()
    }
}

/// Minimal glob match: `*` matches any run of characters, everything else
/// is literal. Sufficient for single-segment backend-name patterns.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    fn helper(p: &[u8], c: &[u8]) -> bool {
        match p.first() {
            None => c.is_empty(),
            Some(b'*') => {
                (0..=c.len()).any(|i| helper(&p[1..], &c[i..]))
            }
            Some(&ch) => c.first() == Some(&ch) && helper(&p[1..], &c[1..]),
        }
    }
    helper(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{DetectedType, Protocol};
    use std::collections::HashMap as StdHashMap;

    fn http_descriptor(name: &str) -> BackendDescriptor {
        BackendDescriptor::new(
            name,
            Protocol::Http,
            DetectedType::Http,
            None,
            vec![],
            StdHashMap::new(),
            Some("http://127.0.0.1:9101".to_string()),
            false,
            None,
        )
    }

    #[tokio::test]
    async fn strips_prefix_and_preserves_query() {
        let router = Router::with_defaults();
        router.register(http_descriptor("echo")).await;
        let m = router.route_request("/echo/hi?x=1").await.unwrap();
        assert_eq!(m.target_path, "/hi?x=1");
        assert_eq!(m.descriptor.name, "echo");
    }

    #[tokio::test]
    async fn no_segments_is_no_match() {
        let router = Router::with_defaults();
        router.register(http_descriptor("echo")).await;
        assert!(router.route_request("/").await.is_none());
    }

    #[tokio::test]
    async fn unregistered_name_is_no_match() {
        let router = Router::with_defaults();
        assert!(router.route_request("/ghost/x").await.is_none());
    }

    #[tokio::test]
    async fn wildcard_pattern_matches_first_segment() {
        let router = Router::with_defaults();
        router.register(http_descriptor("svc-*")).await;
        let m = router.route_request("/svc-42/path").await.unwrap();
        assert_eq!(m.descriptor.name, "svc-*");
        assert_eq!(m.target_path, "/path");
    }

    #[tokio::test]
    async fn preserve_full_path_when_prefix_not_stripped() {
        let router = Router::new(RouterConfig { strip_server_prefix: false, ..RouterConfig::default() });
        router.register(http_descriptor("echo")).await;
        let m = router.route_request("/echo/hi?x=1").await.unwrap();
        assert_eq!(m.target_path, "/echo/hi?x=1");
    }
}
