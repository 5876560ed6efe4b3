//! MCP session lifecycle
//!
//! Every client connection is one [`McpSession`]. The [`SessionManager`] owns
//! the registry and is responsible for cancelling a session's in-flight calls
//! and releasing its relay subscriptions when the client goes away.

pub mod manager;
pub mod mcp_session;

pub use manager::{update_notification, DetachReport, SessionManager};
pub use mcp_session::{
    filter_from_uri, subscription_uri, Invocation, McpSession, Outbound, SubscriptionInfo,
    SUBSCRIPTION_URI_PREFIX,
};
