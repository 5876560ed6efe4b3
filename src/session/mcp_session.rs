//! State owned by one connected MCP client

use crate::mcp::types::JsonRpcNotification;
use crate::relay::{EventStream, QoS};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Channel carrying serialized JSON-RPC messages to the client
pub type Outbound = mpsc::Sender<Value>;

/// Prefix of subscription resource URIs
pub const SUBSCRIPTION_URI_PREFIX: &str = "mqtt://subscription/";

/// Resource URI for a topic filter
pub fn subscription_uri(filter: &str) -> String {
    format!("{}{}", SUBSCRIPTION_URI_PREFIX, filter)
}

/// Topic filter named by a resource URI
pub fn filter_from_uri(uri: &str) -> Option<&str> {
    uri.strip_prefix(SUBSCRIPTION_URI_PREFIX)
        .filter(|filter| !filter.is_empty())
}

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Open,
    Closing,
    Closed,
}

/// Public view of one live subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionInfo {
    /// Subscription id
    #[serde(rename = "subscriptionId")]
    pub id: Uuid,
    /// Topic filter
    pub topic: String,
    /// QoS
    pub qos: QoS,
    /// Resource URI notifications are keyed by
    pub uri: String,
    /// Creation time
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

pub(crate) struct TrackedSubscription {
    pub(crate) stream: EventStream,
    pub(crate) worker: Option<JoinHandle<()>>,
    pub(crate) created_at: DateTime<Utc>,
}

impl TrackedSubscription {
    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.stream.id(),
            topic: self.stream.filter().to_string(),
            qos: self.stream.qos(),
            uri: subscription_uri(self.stream.filter()),
            created_at: self.created_at,
        }
    }
}

/// Handle for one in-flight tool call
///
/// Request ids may be reused by a client, so each registration carries its
/// own nonce and only the handle that registered an entry can finish it.
#[derive(Debug, Clone)]
pub struct Invocation {
    key: String,
    nonce: u64,
    token: CancellationToken,
}

impl Invocation {
    /// Request id the call was registered under
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token cancelled on `notifications/cancelled` or session teardown
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

pub(crate) struct SessionState {
    pub(crate) phase: Phase,
    pub(crate) subscriptions: HashMap<String, TrackedSubscription>,
    pub(crate) invocations: HashMap<String, (u64, CancellationToken)>,
    next_nonce: u64,
}

impl SessionState {
    /// Register a call under `key`, displacing any live call with the same key
    pub(crate) fn register_invocation(&mut self, key: &str) -> (Invocation, Option<CancellationToken>) {
        self.next_nonce += 1;
        let invocation = Invocation {
            key: key.to_string(),
            nonce: self.next_nonce,
            token: CancellationToken::new(),
        };
        let displaced = self
            .invocations
            .insert(key.to_string(), (invocation.nonce, invocation.token.clone()))
            .map(|(_, token)| token);
        (invocation, displaced)
    }

    /// Drop the entry for `invocation` unless a newer call reused its key
    pub(crate) fn finish_invocation(&mut self, invocation: &Invocation) -> bool {
        let current = self
            .invocations
            .get(&invocation.key)
            .map(|(nonce, _)| *nonce == invocation.nonce)
            .unwrap_or(false);
        if current {
            self.invocations.remove(&invocation.key);
        }
        current
    }
}

/// One connected MCP client
pub struct McpSession {
    id: Uuid,
    outbound: Outbound,
    connected_at: DateTime<Utc>,
    pub(crate) state: Mutex<SessionState>,
}

impl McpSession {
    pub(crate) fn new(outbound: Outbound) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            connected_at: Utc::now(),
            state: Mutex::new(SessionState {
                phase: Phase::Open,
                subscriptions: HashMap::new(),
                invocations: HashMap::new(),
                next_nonce: 0,
            }),
        }
    }

    /// Session id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// When the client attached
    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Whether the session still accepts work
    pub fn is_open(&self) -> bool {
        self.state.lock().phase == Phase::Open
    }

    /// Whether teardown has completed
    pub fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    /// Live subscriptions, sorted by topic
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .state
            .lock()
            .subscriptions
            .values()
            .map(TrackedSubscription::info)
            .collect();
        infos.sort_by(|a, b| a.topic.cmp(&b.topic));
        infos
    }

    /// Subscription on `filter`, if any
    pub fn subscription(&self, filter: &str) -> Option<SubscriptionInfo> {
        self.state
            .lock()
            .subscriptions
            .get(filter)
            .map(TrackedSubscription::info)
    }

    /// Number of in-flight tool calls
    pub fn pending_invocations(&self) -> usize {
        self.state.lock().invocations.len()
    }

    /// Send a notification; fails when the client is gone
    pub async fn notify(&self, notification: JsonRpcNotification) -> bool {
        match serde_json::to_value(notification) {
            Ok(value) => self.outbound.send(value).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Send a raw message; fails when the client is gone
    pub async fn send(&self, message: Value) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    /// Remove a subscription whose stream ended on the relay side
    ///
    /// Only removes the entry if it still belongs to `stream_id`.
    pub(crate) fn forget_subscription(&self, filter: &str, stream_id: Uuid) -> bool {
        let mut state = self.state.lock();
        let owned = state
            .subscriptions
            .get(filter)
            .map(|tracked| tracked.stream.id() == stream_id)
            .unwrap_or(false);
        if owned {
            state.subscriptions.remove(filter);
        }
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_roundtrip() {
        let uri = subscription_uri("sensors/+/temp");
        assert_eq!(uri, "mqtt://subscription/sensors/+/temp");
        assert_eq!(filter_from_uri(&uri), Some("sensors/+/temp"));
        assert_eq!(filter_from_uri("mqtt://subscription/"), None);
        assert_eq!(filter_from_uri("file:///etc/passwd"), None);
    }

    #[tokio::test]
    async fn test_new_session_is_open() {
        let (tx, mut rx) = mpsc::channel(4);
        let session = McpSession::new(tx);
        assert!(session.is_open());
        assert!(session.subscriptions().is_empty());
        assert!(session.send(serde_json::json!({"ping": true})).await);
        assert_eq!(rx.recv().await.unwrap()["ping"], true);
    }
}
