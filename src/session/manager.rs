//! Session registry and teardown
//!
//! The manager is the only component that releases broker-side resources when
//! a client goes away. Teardown runs as a transaction: take every owned
//! invocation and subscription in one critical section (and refuse new ones
//! from then on), release all of them, then mark the session closed.

use crate::error::{Error, Result, SessionError};
use crate::mcp::types::JsonRpcNotification;
use crate::relay::{CloseReason, Delivery, EventStream, MqttRelay, QoS};
use crate::session::mcp_session::{
    subscription_uri, Invocation, McpSession, Outbound, Phase, SubscriptionInfo,
    TrackedSubscription,
};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Outcome of a detach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetachReport {
    /// In-flight tool calls whose tokens were cancelled
    pub invocations_cancelled: usize,
    /// Subscriptions handed back to the relay
    pub subscriptions_released: usize,
    /// Relay unsubscribe calls that reported an error
    pub release_failures: usize,
}

/// Registry of connected MCP sessions
pub struct SessionManager {
    relay: Arc<MqttRelay>,
    sessions: RwLock<HashMap<Uuid, Arc<McpSession>>>,
}

impl SessionManager {
    /// Create a manager releasing subscriptions through `relay`
    pub fn new(relay: Arc<MqttRelay>) -> Self {
        Self {
            relay,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Relay used for subscriptions
    pub fn relay(&self) -> &Arc<MqttRelay> {
        &self.relay
    }

    /// Register a new client connection
    pub fn attach(&self, outbound: Outbound) -> Arc<McpSession> {
        let session = Arc::new(McpSession::new(outbound));
        self.sessions.write().insert(session.id(), session.clone());
        info!(session_id = %session.id(), "MCP session attached");
        session
    }

    /// Look up a session
    pub fn get(&self, id: Uuid) -> Option<Arc<McpSession>> {
        self.sessions.read().get(&id).cloned()
    }

    /// Number of attached sessions
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Tear a session down, cancelling its calls and releasing its subscriptions
    ///
    /// Returns `None` if the session is unknown or already being detached.
    #[instrument(skip(self))]
    pub async fn detach(&self, id: Uuid) -> Option<DetachReport> {
        let session = self.get(id)?;

        let (invocations, subscriptions) = {
            let mut state = session.state.lock();
            if state.phase != Phase::Open {
                return None;
            }
            state.phase = Phase::Closing;
            (
                std::mem::take(&mut state.invocations),
                std::mem::take(&mut state.subscriptions),
            )
        };

        let mut report = DetachReport {
            invocations_cancelled: invocations.len(),
            ..Default::default()
        };
        for (_, token) in invocations.values() {
            token.cancel();
        }

        for (filter, tracked) in subscriptions {
            report.subscriptions_released += 1;
            if let Err(e) = self.release(tracked).await {
                report.release_failures += 1;
                warn!(session_id = %id, filter = %filter, error = %e, "Failed to release subscription");
            }
        }

        self.sessions.write().remove(&id);
        session.state.lock().phase = Phase::Closed;
        info!(
            session_id = %id,
            invocations = report.invocations_cancelled,
            subscriptions = report.subscriptions_released,
            "MCP session detached"
        );
        Some(report)
    }

    /// Register an in-flight tool call
    ///
    /// A live call registered under the same key is cancelled.
    pub fn track_invocation(&self, session: &McpSession, call_key: &str) -> Result<Invocation> {
        let mut state = session.state.lock();
        if state.phase != Phase::Open {
            return Err(SessionError::Closed(session.id().to_string()).into());
        }
        let (invocation, displaced) = state.register_invocation(call_key);
        if let Some(previous) = displaced {
            previous.cancel();
        }
        Ok(invocation)
    }

    /// Forget a completed tool call
    pub fn finish_invocation(&self, session: &McpSession, invocation: &Invocation) {
        if !session.state.lock().finish_invocation(invocation) {
            debug!(session_id = %session.id(), call = invocation.key(), "Request id reused; keeping newer call");
        }
    }

    /// Cancel an in-flight tool call; `false` if it was not found
    pub fn cancel_invocation(&self, session: &McpSession, call_key: &str) -> bool {
        match session.state.lock().invocations.remove(call_key) {
            Some((_, token)) => {
                token.cancel();
                debug!(session_id = %session.id(), call = call_key, "Invocation cancelled");
                true
            }
            None => false,
        }
    }

    /// Subscribe `session` to `filter` through the relay
    ///
    /// The relay subscription and its hand-over to the session run in their
    /// own task, so dropping the caller (a cancelled tool call, a closed
    /// connection) cannot leave a broker subscription nobody owns. If the
    /// session closes while the subscribe is in flight the stream is released.
    #[instrument(skip(self, session), fields(session_id = %session.id()))]
    pub async fn subscribe(
        &self,
        session: &Arc<McpSession>,
        filter: &str,
        qos: QoS,
    ) -> Result<SubscriptionInfo> {
        if !session.is_open() {
            return Err(SessionError::Closed(session.id().to_string()).into());
        }
        let relay = self.relay.clone();
        let session = session.clone();
        let filter = filter.to_string();
        tokio::spawn(async move {
            match relay.subscribe(&filter, qos).await {
                Ok(stream) => adopt(&relay, &session, stream).await,
                Err(e) => Err(Error::from(e)),
            }
        })
        .await
        .map_err(|e| Error::Generic(format!("subscribe task failed: {}", e)))?
    }

    /// Hand ownership of a relay stream to `session` and start forwarding it
    ///
    /// If the session already subscribes to the same filter the existing
    /// subscription is returned and `stream` is released. If the session is
    /// closing, `stream` is released and an error returned.
    #[instrument(skip(self, session, stream), fields(session_id = %session.id(), topic = %stream.filter()))]
    pub async fn track_subscription(
        &self,
        session: &Arc<McpSession>,
        stream: EventStream,
    ) -> Result<SubscriptionInfo> {
        adopt(&self.relay, session, stream).await
    }

    /// Stop and release the subscription on `filter`
    #[instrument(skip(self, session), fields(session_id = %session.id()))]
    pub async fn untrack_subscription(
        &self,
        session: &McpSession,
        filter: &str,
    ) -> Result<SubscriptionInfo> {
        let tracked = {
            let mut state = session.state.lock();
            if state.phase != Phase::Open {
                return Err(SessionError::Closed(session.id().to_string()).into());
            }
            state
                .subscriptions
                .remove(filter)
                .ok_or_else(|| SessionError::UnknownSubscription(filter.to_string()))?
        };
        let info = tracked.info();
        self.release(tracked).await?;
        Ok(info)
    }

    async fn release(&self, mut tracked: TrackedSubscription) -> Result<()> {
        if let Some(worker) = tracked.worker.take() {
            worker.abort();
        }
        self.relay
            .unsubscribe(tracked.stream.id())
            .await
            .map_err(Error::from)
    }
}

/// Track `stream` in `session`, releasing it if the session cannot own it
async fn adopt(
    relay: &MqttRelay,
    session: &Arc<McpSession>,
    stream: EventStream,
) -> Result<SubscriptionInfo> {
    enum Outcome {
        Tracked(SubscriptionInfo),
        Duplicate(SubscriptionInfo, EventStream),
        Rejected(EventStream),
    }

    let outcome = {
        let mut state = session.state.lock();
        if state.phase != Phase::Open {
            Outcome::Rejected(stream)
        } else if let Some(existing) = state.subscriptions.get(stream.filter()) {
            Outcome::Duplicate(existing.info(), stream)
        } else {
            let worker = tokio::spawn(forward(Arc::downgrade(session), stream.clone()));
            let tracked = TrackedSubscription {
                stream,
                worker: Some(worker),
                created_at: Utc::now(),
            };
            let info = tracked.info();
            state.subscriptions.insert(info.topic.clone(), tracked);
            Outcome::Tracked(info)
        }
    };

    match outcome {
        Outcome::Tracked(info) => {
            info!(subscription_id = %info.id, "Subscription tracked");
            Ok(info)
        }
        Outcome::Duplicate(info, stream) => {
            debug!("Filter already subscribed in this session; reusing");
            relay.unsubscribe(stream.id()).await?;
            Ok(info)
        }
        Outcome::Rejected(stream) => {
            relay.unsubscribe(stream.id()).await?;
            Err(SessionError::Closed(session.id().to_string()).into())
        }
    }
}

/// Build the update notification for one delivery
pub fn update_notification(stream: &EventStream, delivery: &Delivery) -> JsonRpcNotification {
    JsonRpcNotification::new(
        "notifications/resources/updated",
        json!({
            "uri": subscription_uri(stream.filter()),
            "subscriptionId": stream.id(),
            "sequence": delivery.sequence,
            "lossy": delivery.lossy,
            "dropped": delivery.dropped,
            "message": delivery.message.to_json(),
        }),
    )
}

/// Drain one subscription's queue into its session's outbound channel
async fn forward(session: Weak<McpSession>, stream: EventStream) {
    while let Some(delivery) = stream.next().await {
        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.notify(update_notification(&stream, &delivery)).await {
            debug!(session_id = %session.id(), "Client gone; forwarder stopping");
            return;
        }
    }

    if let Some(CloseReason::BrokerLost(reason)) = stream.queue().close_reason() {
        let Some(session) = session.upgrade() else {
            return;
        };
        if session.forget_subscription(stream.filter(), stream.id()) {
            warn!(session_id = %session.id(), topic = %stream.filter(), reason = %reason, "Subscription lost on broker side");
            session
                .notify(JsonRpcNotification::new(
                    "notifications/resources/closed",
                    json!({
                        "uri": subscription_uri(stream.filter()),
                        "subscriptionId": stream.id(),
                        "reason": reason,
                    }),
                ))
                .await;
        }
    }
}
