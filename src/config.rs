//! JSON configuration loader.
//!
//! Out of scope for the core proper: the core accepts an already-validated
//! `Vec<BackendDescriptor>`. This loader is the minimal external collaborator
//! a real binary needs to get from a file on disk to that vector. It does
//! not scan directories or infer backend types — only structural JSON
//! deserialization plus the same validation the core would run anyway.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::descriptor::BackendDescriptor;
use crate::error::{GatewayError, Result};

/// Top-level shape of a gateway config file.
#[derive(Debug, Deserialize)]
pub struct GatewayConfigFile {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub port_range: Option<(u16, u16)>,
    #[serde(default = "default_true")]
    pub cors: bool,
    #[serde(default = "default_true")]
    pub metrics: bool,
    #[serde(default)]
    pub auth: bool,
    #[serde(default)]
    pub rate_limit: bool,
    #[serde(default = "default_true")]
    pub websocket: bool,
    pub servers: Vec<BackendDescriptor>,
}

fn default_true() -> bool {
    true
}

/// Read and validate a config file, returning its descriptors finalized
/// (capabilities recomputed) and ready to hand to `Gateway::new`.
pub async fn load(path: impl AsRef<Path>) -> Result<GatewayConfigFile> {
    let raw = tokio::fs::read_to_string(path).await?;
    let mut config: GatewayConfigFile = serde_json::from_str(&raw)?;
    config.servers = config
        .servers
        .into_iter()
        .map(BackendDescriptor::finalize)
        .collect();
    validate(&config.servers)?;
    Ok(config)
}

/// Structural validation shared by every loader: unique names, each
/// descriptor individually valid.
pub fn validate(servers: &[BackendDescriptor]) -> Result<()> {
    let mut seen = HashSet::new();
    for d in servers {
        if !seen.insert(d.name.clone()) {
            return Err(GatewayError::DuplicateName(d.name.clone()));
        }
        d.validate()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "host": "127.0.0.1",
                "port": 8080,
                "servers": [
                    {{"name": "echo", "protocol": "http", "url": "http://127.0.0.1:9101"}}
                ]
            }}"#
        )
        .unwrap();

        let config = load(file.path()).await.unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.servers[0].name, "echo");
        assert!(!config.servers[0].capabilities.requires_stdio);
    }

    #[tokio::test]
    async fn rejects_duplicate_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "servers": [
                    {{"name": "dup", "protocol": "http", "url": "http://127.0.0.1:9101"}},
                    {{"name": "dup", "protocol": "http", "url": "http://127.0.0.1:9102"}}
                ]
            }}"#
        )
        .unwrap();

        assert!(matches!(load(file.path()).await, Err(GatewayError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn rejects_http_descriptor_without_url() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"servers": [{{"name": "api", "protocol": "http"}}]}}"#).unwrap();
        assert!(matches!(load(file.path()).await, Err(GatewayError::InvalidConfig(_, _))));
    }
}
