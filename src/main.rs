//! MCP Bridge daemon
//!
//! Starts every configured MCP server, keeps them supervised until Ctrl-C,
//! then shuts them all down.

use std::path::PathBuf;

use clap::Parser;

use mcp_bridge::mcp_host::{BridgeSettings, HighTierPolicy, McpBridge};
use mcp_bridge::{init_tracing, LogTarget};

#[derive(Parser, Debug)]
#[command(name = "mcp-bridge")]
#[command(about = "Supervisor for stdio MCP servers with risk-tiered execution")]
struct Args {
    /// Server configuration file (JSON, or YAML by extension)
    #[arg(long, env = "MCP_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, conflicts_with = "log_to_data_dir")]
    log_file: Option<PathBuf>,

    /// Write logs to bridge.log in the platform data directory
    #[arg(long)]
    log_to_data_dir: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// HIGH risk servers without docker config: downgrade or reject
    #[arg(long)]
    high_tier_policy: Option<HighTierPolicy>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let target = match (args.log_file, args.log_to_data_dir) {
        (Some(path), _) => LogTarget::File(path),
        (None, true) => LogTarget::DataDir,
        (None, false) => LogTarget::Stderr,
    };
    init_tracing(target, args.log_json)?;

    let mut settings = BridgeSettings::from_env();
    if let Some(policy) = args.high_tier_policy {
        settings.high_tier_policy = policy;
    }

    let bridge = McpBridge::from_config(args.config.as_deref(), settings);
    let configured = bridge.configured_servers();
    if configured.is_empty() {
        tracing::warn!("no MCP servers configured");
    }

    let failures = bridge.start_all().await;
    for summary in bridge.list_servers().await {
        tracing::info!(
            server = %summary.id,
            pid = ?summary.pid,
            state = ?summary.initialization_state,
            risk = ?summary.risk_level,
            sandboxed = ?summary.running_in_sandbox,
            "server status"
        );
    }
    tracing::info!(
        configured = configured.len(),
        failed = failures.len(),
        "startup complete, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    bridge.shutdown_all().await;
    tracing::info!("all servers stopped");

    Ok(())
}
