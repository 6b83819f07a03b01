//! Backend descriptors — the validated, immutable input to the gateway core.
//!
//! A `BackendDescriptor` is produced by an external config loader (the CLI's
//! `config.rs`, or any other caller) and handed to `Gateway::new` as a plain
//! `Vec`. The core never mutates a descriptor after accepting it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};

/// Executables a stdio backend is allowed to spawn.
///
/// Checked against the basename of `command` — never the full path — so
/// `/usr/local/bin/node` and `node` are both accepted.
const COMMAND_ALLOWLIST: &[&str] = &[
    "node", "python", "python3", "npx", "yarn", "pnpm", "deno", "bun",
];

/// Characters that are never allowed in a command string or a single arg.
const METACHARACTERS: &[char] = &[';', '&', '|', '$', '`'];

/// Transport a backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Stdio,
    Http,
}

/// Classification hint used only for diagnostics and validation nudges —
/// never load-bearing for routing or supervision decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectedType {
    Docker,
    Npx,
    Http,
    Custom,
}

/// Health-check cadence for a backend, if configured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
}

/// Capability flags derived once from a descriptor at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub requires_stdio: bool,
    pub supports_health_check: bool,
    pub requires_environment: bool,
    pub can_restart: bool,
}

impl Capabilities {
    fn derive(protocol: Protocol, health_check: &Option<HealthCheckConfig>, env: &HashMap<String, String>, restart: bool) -> Self {
        Self {
            requires_stdio: protocol == Protocol::Stdio,
            supports_health_check: health_check.is_some(),
            requires_environment: !env.is_empty(),
            can_restart: restart,
        }
    }
}

/// A validated, immutable backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub protocol: Protocol,
    #[serde(default = "default_detected_type")]
    pub detected_type: DetectedType,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

fn default_detected_type() -> DetectedType {
    DetectedType::Custom
}

impl BackendDescriptor {
    /// Construct a descriptor, deriving its capability flags.
    ///
    /// This is the only constructor; deserialized descriptors run their
    /// derived fields through this same path via `finalize()` so a
    /// hand-built descriptor and a JSON-loaded one always agree.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        protocol: Protocol,
        detected_type: DetectedType,
        command: Option<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        url: Option<String>,
        restart: bool,
        health_check: Option<HealthCheckConfig>,
    ) -> Self {
        let capabilities = Capabilities::derive(protocol, &health_check, &env, restart);
        Self {
            name: name.into(),
            protocol,
            detected_type,
            command,
            args,
            env,
            url,
            capabilities,
            restart,
            health_check,
        }
    }

    /// Recompute `capabilities` from the other fields — call after
    /// deserializing from an external loader that doesn't know to derive it.
    pub fn finalize(mut self) -> Self {
        self.capabilities = Capabilities::derive(self.protocol, &self.health_check, &self.env, self.restart);
        self
    }

    /// Structural validation independent of spawnability: non-empty name,
    /// transport-appropriate required fields present.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GatewayError::InvalidConfig(
                self.name.clone(),
                "name must be non-empty".into(),
            ));
        }
        match self.protocol {
            Protocol::Http => {
                if self.url.is_none() {
                    return Err(GatewayError::InvalidConfig(
                        self.name.clone(),
                        "http protocol requires 'url'".into(),
                    ));
                }
            }
            Protocol::Stdio => {
                // command is only required when a child is actually spawned —
                // validated separately by validate_spawnable() at spawn time.
            }
        }
        Ok(())
    }

    /// Validate that this descriptor is safe to spawn as a child process.
    ///
    /// Called both at gateway composition (fail fast) and again by the
    /// supervisor immediately before every spawn/restart.
    pub fn validate_spawnable(&self) -> Result<()> {
        if self.protocol != Protocol::Stdio {
            return Err(GatewayError::HttpNotSpawnable(self.name.clone()));
        }
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| GatewayError::NoCommand(self.name.clone()))?;

        if command.contains("..") || command.chars().any(|c| METACHARACTERS.contains(&c)) {
            return Err(GatewayError::DangerousArgs(
                self.name.clone(),
                format!("command '{command}' contains disallowed characters"),
            ));
        }

        let basename = command
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(command.as_str());
        if !COMMAND_ALLOWLIST.contains(&basename) {
            return Err(GatewayError::DisallowedCommand(
                self.name.clone(),
                basename.to_string(),
            ));
        }

        for arg in &self.args {
            if arg.chars().any(|c| METACHARACTERS.contains(&c)) {
                return Err(GatewayError::DangerousArgs(
                    self.name.clone(),
                    format!("arg '{arg}' contains disallowed characters"),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdio(name: &str, command: &str, args: Vec<&str>) -> BackendDescriptor {
        BackendDescriptor::new(
            name,
            Protocol::Stdio,
            DetectedType::Custom,
            Some(command.to_string()),
            args.into_iter().map(str::to_string).collect(),
            HashMap::new(),
            None,
            false,
            None,
        )
    }

    #[test]
    fn capabilities_derived_from_protocol_and_restart() {
        let d = stdio("mem", "node", vec![]);
        assert!(d.capabilities.requires_stdio);
        assert!(!d.capabilities.can_restart);

        let mut env = HashMap::new();
        env.insert("FOO".into(), "bar".into());
        let d = BackendDescriptor::new(
            "x",
            Protocol::Http,
            DetectedType::Http,
            None,
            vec![],
            env,
            Some("http://localhost".into()),
            true,
            None,
        );
        assert!(!d.capabilities.requires_stdio);
        assert!(d.capabilities.requires_environment);
        assert!(d.capabilities.can_restart);
    }

    #[test]
    fn http_descriptor_requires_url() {
        let d = BackendDescriptor::new(
            "api",
            Protocol::Http,
            DetectedType::Http,
            None,
            vec![],
            HashMap::new(),
            None,
            false,
            None,
        );
        assert!(matches!(d.validate(), Err(GatewayError::InvalidConfig(_, _))));
    }

    #[test]
    fn command_allowlist_rejects_unknown_binary() {
        let d = stdio("rm-it", "rm", vec!["-rf".into(), "/".into()]);
        assert!(matches!(
            d.validate_spawnable(),
            Err(GatewayError::DisallowedCommand(_, basename)) if basename == "rm"
        ));
    }

    #[test]
    fn command_allowlist_accepts_basename_of_absolute_path() {
        let d = stdio("mem", "/usr/local/bin/node", vec![]);
        assert!(d.validate_spawnable().is_ok());
    }

    #[test]
    fn args_with_metacharacters_rejected() {
        let d = stdio("mem", "node", vec!["-e", "require('x'); rm -rf /"]);
        assert!(matches!(d.validate_spawnable(), Err(GatewayError::DangerousArgs(_, _))));
    }

    #[test]
    fn http_descriptor_not_spawnable() {
        let d = BackendDescriptor::new(
            "api",
            Protocol::Http,
            DetectedType::Http,
            None,
            vec![],
            HashMap::new(),
            Some("http://localhost".into()),
            false,
            None,
        );
        assert!(matches!(d.validate_spawnable(), Err(GatewayError::HttpNotSpawnable(_))));
    }

    #[test]
    fn missing_command_rejected() {
        let d = BackendDescriptor::new(
            "mem", Protocol::Stdio, DetectedType::Custom, None, vec![], HashMap::new(), None, false, None,
        );
        assert!(matches!(d.validate_spawnable(), Err(GatewayError::NoCommand(_))));
    }
}
