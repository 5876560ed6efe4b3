//! EMQX MCP Bridge server
//!
//! Exposes an EMQX broker to MCP clients over stdio or TCP.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use emqx_mcp_bridge::config::BridgeConfig;
use emqx_mcp_bridge::relay::{MqttRelay, RumqttConnector};
use emqx_mcp_bridge::{BrokerClient, McpServer, SessionManager, ToolDispatcher};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// How MCP clients reach the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    /// One client on stdin/stdout
    Stdio,
    /// Any number of clients on a TCP port
    Tcp,
}

/// EMQX MCP Bridge
#[derive(Parser, Debug)]
#[command(name = "emqx-mcp")]
#[command(version)]
#[command(about = "MCP server bridging AI agents to an EMQX MQTT broker")]
struct Args {
    /// Transport to serve MCP on
    #[arg(short, long, value_enum, default_value = "stdio")]
    transport: Transport,

    /// Port to listen on (tcp transport)
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Host to bind to (tcp transport)
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout carries the MCP stream, so logs go to stderr
    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = BridgeConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    let broker = Arc::new(BrokerClient::new(&config).context("failed to build broker client")?);
    let relay = if config.relay_enabled() {
        let connector = RumqttConnector::from_config(&config)?;
        Arc::new(
            MqttRelay::connect(
                Arc::new(connector),
                config.mqtt_pool_size,
                config.queue_capacity,
            )
            .await
            .context("failed to start MQTT relay")?,
        )
    } else {
        tracing::warn!("EMQX_MQTT_URL not set; topic subscriptions and MQTT publishing are disabled");
        Arc::new(MqttRelay::disabled())
    };
    let sessions = Arc::new(SessionManager::new(relay.clone()));
    let server = Arc::new(McpServer::new(ToolDispatcher::new(
        broker.clone(),
        relay.clone(),
        sessions,
    )));

    tracing::info!(api_url = %config.api_url, transport = ?args.transport, "EMQX MCP bridge starting");

    let serve = async {
        match args.transport {
            Transport::Stdio => server.clone().run_stdio().await?,
            Transport::Tcp => {
                let addr: SocketAddr = format!("{}:{}", args.host, args.port)
                    .parse()
                    .with_context(|| format!("invalid listen address {}:{}", args.host, args.port))?;
                server.clone().run_tcp(addr).await?
            }
        }
        Ok::<(), anyhow::Error>(())
    };

    let outcome = tokio::select! {
        result = serve => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down");
            Ok(())
        }
    };

    relay.shutdown().await;
    broker.close().await;
    outcome
}
