//! EMQX MCP Bridge - MQTT broker control and live topic streaming for AI agents
//!
//! This crate provides an MCP (Model Context Protocol) server that exposes an
//! EMQX broker's management API as tools, and streams live MQTT traffic back
//! to MCP clients as resource update notifications.
//!
//! # Features
//!
//! - **MCP Server**: line-delimited JSON-RPC over stdio or TCP
//! - **Broker Client**: pooled, authenticated EMQX v5 REST client with retries
//! - **MQTT Relay**: shared MQTT connections with bounded per-subscription queues
//! - **Sessions**: per-client ownership of subscriptions and in-flight calls
//!
//! # Architecture
//!
//! ```text
//! AI Agent ──▶ MCP Server ──▶ Tool Dispatcher ──┬──▶ Broker Client ──▶ EMQX REST API
//!                  ▲               │            │
//!                  │               ▼            └──▶ MQTT Relay ──────▶ EMQX MQTT
//!                  │        Session Manager              │
//!                  │               │                     ▼
//!                  └─ notifications ◀── forwarder ◀── event queues
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use emqx_mcp_bridge::broker::BrokerClient;
//! use emqx_mcp_bridge::config::BridgeConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::from_env()?;
//!     config.validate()?;
//!
//!     let broker = BrokerClient::new(&config)?;
//!     let stats = broker.stats(true).await?;
//!     println!("Connections: {}", stats["connections.count"]);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod mcp;
pub mod relay;
pub mod session;
pub mod translate;

// Re-exports for convenience
pub use broker::BrokerClient;
pub use config::BridgeConfig;
pub use error::{Error, Result};
pub use mcp::{McpServer, ToolDispatcher};
pub use relay::MqttRelay;
pub use session::SessionManager;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
