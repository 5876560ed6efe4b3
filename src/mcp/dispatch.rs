//! Tool dispatch
//!
//! The dispatch table pairs every [`ToolDescriptor`] with its handler. Lookup
//! and validation happen before a handler is called, so a bad call never
//! reaches the broker.

use crate::broker::BrokerClient;
use crate::error::{McpError, Result, ValidationError};
use crate::mcp::handlers::{self, Handler, ToolContext};
use crate::mcp::tools::{self, ToolDescriptor};
use crate::mcp::types::McpToolDefinition;
use crate::relay::MqttRelay;
use crate::session::{McpSession, SessionManager};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

struct Route {
    descriptor: &'static ToolDescriptor,
    handler: Handler,
}

static ROUTES: &[Route] = &[
    Route {
        descriptor: &tools::PUBLISH_MQTT_MESSAGE,
        handler: handlers::publish_mqtt_message,
    },
    Route {
        descriptor: &tools::LIST_MQTT_CLIENTS,
        handler: handlers::list_mqtt_clients,
    },
    Route {
        descriptor: &tools::GET_MQTT_CLIENT,
        handler: handlers::get_mqtt_client,
    },
    Route {
        descriptor: &tools::KICK_MQTT_CLIENT,
        handler: handlers::kick_mqtt_client,
    },
    Route {
        descriptor: &tools::LIST_MQTT_SUBSCRIPTIONS,
        handler: handlers::list_mqtt_subscriptions,
    },
    Route {
        descriptor: &tools::LIST_MQTT_TOPICS,
        handler: handlers::list_mqtt_topics,
    },
    Route {
        descriptor: &tools::GET_BROKER_STATS,
        handler: handlers::get_broker_stats,
    },
    Route {
        descriptor: &tools::SUBSCRIBE_MQTT_TOPIC,
        handler: handlers::subscribe_mqtt_topic,
    },
    Route {
        descriptor: &tools::UNSUBSCRIBE_MQTT_TOPIC,
        handler: handlers::unsubscribe_mqtt_topic,
    },
    Route {
        descriptor: &tools::LIST_ACTIVE_SUBSCRIPTIONS,
        handler: handlers::list_active_subscriptions,
    },
];

fn route(name: &str) -> Option<&'static Route> {
    ROUTES.iter().find(|route| route.descriptor.name == name)
}

/// Descriptor of a registered tool
pub fn descriptor(name: &str) -> Option<&'static ToolDescriptor> {
    route(name).map(|route| route.descriptor)
}

/// Every registered descriptor, in table order
pub fn descriptors() -> impl Iterator<Item = &'static ToolDescriptor> {
    ROUTES.iter().map(|route| route.descriptor)
}

/// Routes tool calls to their handlers
pub struct ToolDispatcher {
    broker: Arc<BrokerClient>,
    relay: Arc<MqttRelay>,
    sessions: Arc<SessionManager>,
}

impl ToolDispatcher {
    /// Create a dispatcher over the shared backends
    pub fn new(
        broker: Arc<BrokerClient>,
        relay: Arc<MqttRelay>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            broker,
            relay,
            sessions,
        }
    }

    /// Session registry
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Broker client
    pub fn broker(&self) -> &Arc<BrokerClient> {
        &self.broker
    }

    /// Relay
    pub fn relay(&self) -> &Arc<MqttRelay> {
        &self.relay
    }

    /// Get all tool definitions
    pub fn definitions(&self) -> Vec<McpToolDefinition> {
        descriptors().map(ToolDescriptor::definition).collect()
    }

    /// Validate and run one tool call
    ///
    /// Returns [`McpError::Cancelled`] if `cancel` fires first. Side effects
    /// the handler already caused are not rolled back.
    #[instrument(skip(self, args, session, cancel), fields(session_id = %session.id()))]
    pub async fn invoke(
        &self,
        tool: &str,
        args: Value,
        session: &Arc<McpSession>,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let route = route(tool).ok_or_else(|| ValidationError::UnknownTool(tool.to_string()))?;
        let params = route.descriptor.validate(&args)?;
        info!(tool, "Executing tool");

        let ctx = ToolContext {
            broker: self.broker.clone(),
            relay: self.relay.clone(),
            sessions: self.sessions.clone(),
            session: session.clone(),
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(tool, "Tool call cancelled");
                Err(McpError::Cancelled.into())
            }
            result = (route.handler)(ctx, params) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_available_tools() {
        let names: Vec<&str> = descriptors().map(|d| d.name).collect();
        assert_eq!(names, tools::AVAILABLE_TOOLS);
    }

    #[test]
    fn test_lookup() {
        assert!(descriptor("kick_mqtt_client").is_some());
        assert!(descriptor("web_navigate").is_none());
    }
}
