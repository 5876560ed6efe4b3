//! Model Context Protocol (MCP) server module
//!
//! This module implements the MCP side of the bridge: the JSON-RPC connection
//! loop, the static tool table, parameter validation, and the handlers that
//! call into the broker client, the MQTT relay, and the session manager.

pub mod dispatch;
mod handlers;
mod server;
pub mod tools;
/// MCP protocol types
pub mod types;

pub use dispatch::ToolDispatcher;
pub use handlers::{Handler, ToolContext};
pub use server::McpServer;
pub use tools::{ParamSpec, ParamType, Params, ToolDescriptor, AVAILABLE_TOOLS};
pub use types::{
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, McpCapabilities,
    McpServerInfo, McpToolDefinition, ToolCallParams, ToolCallResult, ToolContent,
};
