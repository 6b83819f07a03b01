//! gatewayd — standalone binary for mcp-gateway.
//!
//! One subcommand: `gatewayd serve` reads a JSON config describing the
//! backend set, binds the gateway's public HTTP listener, and runs until
//! Ctrl-C.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcp_gateway::{load_config, Gateway, GatewayConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT_START: u16 = 3001;
const DEFAULT_PORT_END: u16 = 3099;

#[derive(Parser)]
#[command(name = "gatewayd", version, about = "MCP-style gateway — fronts stdio and HTTP backends through one HTTP listener")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway's HTTP listener.
    Serve {
        /// Path to the gateway config file [default: ./gateway.json or ~/.config/gatewayd/gateway.json]
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Bind address, overrides the config file's `host`.
        #[arg(long)]
        host: Option<String>,
        /// Bind port, overrides the config file's `port`.
        #[arg(short, long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cancel = CancellationToken::new();

    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down gateway");
        cancel_for_signal.cancel();
    });

    match cli.command {
        Commands::Serve { config, host, port } => {
            let config_path = resolve_config_path(config)?;
            run_serve(config_path, host, port, cancel).await?;
        }
    }

    Ok(())
}

/// Load the config, build the gateway, register every backend, and serve
/// until `cancel` fires.
async fn run_serve(
    config_path: PathBuf,
    host_override: Option<String>,
    port_override: Option<u16>,
    cancel: CancellationToken,
) -> Result<()> {
    let file = load_config(&config_path)
        .await
        .with_context(|| format!("failed to load config file {config_path:?}"))?;

    let host = host_override
        .or_else(|| file.host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = port_override.or(file.port).unwrap_or(8080);
    let (port_start, port_end) = file.port_range.unwrap_or((DEFAULT_PORT_START, DEFAULT_PORT_END));

    let gateway_config = GatewayConfig {
        cors: file.cors,
        websocket: file.websocket,
        #[cfg(feature = "metrics")]
        metrics: file.metrics,
    };

    let gateway = Gateway::new(gateway_config, port_start, port_end)
        .await
        .context("failed to construct gateway")?;
    gateway.register_all(file.servers).await;

    tracing::info!(%host, %port, "gateway starting");
    gateway
        .serve(&host, port, cancel)
        .await
        .context("gateway server error")?;

    tracing::info!("gateway stopped");
    Ok(())
}

/// Resolve the config path: explicit flag → ./gateway.json →
/// ~/.config/gatewayd/gateway.json.
fn resolve_config_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    let local = Path::new("gateway.json");
    if local.exists() {
        return Ok(local.to_path_buf());
    }

    if let Some(config_dir) = dirs::config_dir() {
        let xdg = config_dir.join("gatewayd").join("gateway.json");
        if xdg.exists() {
            return Ok(xdg);
        }
    }

    anyhow::bail!(
        "no gateway.json found. Searched ./gateway.json and ~/.config/gatewayd/gateway.json. \
         Use --config to specify a path."
    )
}
