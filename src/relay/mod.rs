//! MQTT relay module
//!
//! A fixed pool of MQTT connections shared by every bridge-level
//! subscription. Inbound messages are fanned out to bounded per-subscription
//! queues by one dispatcher task per connection.
//!
//! # Architecture
//!
//! ```text
//!  connection 0 ──events──▶ dispatcher 0 ──┬──▶ queue (sub a, "t/#")
//!                                          └──▶ queue (sub b, "t/1")
//!  connection 1 ──events──▶ dispatcher 1 ─────▶ queue (sub c, "x/+")
//! ```
//!
//! Filters are pinned to one connection for their lifetime, so per-filter
//! delivery order is the broker's order on that connection. Writes to one
//! connection (subscribe, unsubscribe, publish) are serialized by a checkout
//! lock.

pub mod link;
pub mod message;
pub mod queue;
pub mod rumqtt;
pub mod topic;

pub use link::{LinkEvent, MqttConnector, MqttLink};
pub use message::{Delivery, InboundMessage, QoS};
pub use queue::{CloseReason, EventQueue, PushOutcome};
pub use rumqtt::RumqttConnector;

use crate::error::RelayError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Deadline for a single write on a relay connection
const OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Acknowledgement of a relay publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishAck {
    /// Topic published to
    pub topic: String,
    /// QoS requested
    pub qos: QoS,
    /// Retain flag
    pub retain: bool,
    /// Pool connection that carried it
    pub connection: usize,
    /// When the connection accepted it
    #[serde(rename = "publishedAt")]
    pub published_at: DateTime<Utc>,
}

/// Consumer side of one relay subscription
#[derive(Debug, Clone)]
pub struct EventStream {
    id: Uuid,
    filter: String,
    qos: QoS,
    queue: Arc<EventQueue>,
}

impl EventStream {
    /// Relay-assigned id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Topic filter
    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Granted QoS
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Underlying queue
    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Wait for the next delivery; `None` once the subscription has ended
    pub async fn next(&self) -> Option<Delivery> {
        self.queue.pop().await
    }
}

struct Route {
    filter: String,
    slot: usize,
    queue: Arc<EventQueue>,
}

#[derive(Debug, Clone, Copy)]
struct FilterEntry {
    qos: QoS,
    refs: usize,
}

struct Slot {
    link: Arc<dyn MqttLink>,
    write: tokio::sync::Mutex<()>,
    filters: Mutex<HashMap<String, FilterEntry>>,
}

struct RelayInner {
    slots: Vec<Slot>,
    routes: RwLock<HashMap<Uuid, Route>>,
    queue_capacity: usize,
}

/// Shared pool of MQTT connections
pub struct MqttRelay {
    inner: Arc<RelayInner>,
    next_publish: AtomicUsize,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

impl MqttRelay {
    /// A relay without connections; every operation fails with
    /// [`RelayError::Disabled`]
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                slots: Vec::new(),
                routes: RwLock::new(HashMap::new()),
                queue_capacity: 1,
            }),
            next_publish: AtomicUsize::new(0),
            dispatchers: Mutex::new(Vec::new()),
        }
    }

    /// Open `pool_size` connections through `connector`
    #[instrument(skip(connector))]
    pub async fn connect(
        connector: Arc<dyn MqttConnector>,
        pool_size: usize,
        queue_capacity: usize,
    ) -> Result<Self, RelayError> {
        let mut slots = Vec::with_capacity(pool_size);
        let mut receivers = Vec::with_capacity(pool_size);
        for index in 0..pool_size.max(1) {
            let (link, events) = connector.connect(index).await?;
            slots.push(Slot {
                link,
                write: tokio::sync::Mutex::new(()),
                filters: Mutex::new(HashMap::new()),
            });
            receivers.push(events);
        }

        let inner = Arc::new(RelayInner {
            slots,
            routes: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
        });
        let dispatchers = receivers
            .into_iter()
            .enumerate()
            .map(|(slot, events)| tokio::spawn(dispatch(inner.clone(), slot, events)))
            .collect();

        info!(connections = inner.slots.len(), queue_capacity, "MQTT relay ready");
        Ok(Self {
            inner,
            next_publish: AtomicUsize::new(0),
            dispatchers: Mutex::new(dispatchers),
        })
    }

    /// Whether the relay has any connections
    pub fn is_enabled(&self) -> bool {
        !self.inner.slots.is_empty()
    }

    /// Number of live bridge-level subscriptions
    pub fn route_count(&self) -> usize {
        self.inner.routes.read().len()
    }

    /// Number of distinct broker-side subscriptions across the pool
    pub fn broker_filter_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.filters.lock().len())
            .sum()
    }

    /// Subscribe to `filter`, returning a stream of its messages
    #[instrument(skip(self))]
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<EventStream, RelayError> {
        if !self.is_enabled() {
            return Err(RelayError::Disabled);
        }
        topic::validate_filter(filter)?;

        let index = self.inner.pick_slot(filter);
        let slot = &self.inner.slots[index];
        let _checkout = slot.write.lock().await;

        let existing = slot.filters.lock().get(filter).copied();
        let wanted = existing.map_or(qos, |entry| entry.qos.max(qos));
        if existing.map_or(true, |entry| entry.qos < qos) {
            if let Err(e) = with_deadline(slot.link.subscribe(filter, wanted)).await {
                // An unacknowledged SUBSCRIBE may still be granted later
                if existing.is_none() && !matches!(e, RelayError::Rejected(_)) {
                    if let Err(cleanup) = with_deadline(slot.link.unsubscribe(filter)).await {
                        debug!(filter, error = %cleanup, "Cleanup unsubscribe failed");
                    }
                }
                return Err(e);
            }
        }

        slot.filters
            .lock()
            .entry(filter.to_string())
            .and_modify(|entry| {
                entry.refs += 1;
                entry.qos = wanted;
            })
            .or_insert(FilterEntry {
                qos: wanted,
                refs: 1,
            });

        let id = Uuid::new_v4();
        let queue = Arc::new(EventQueue::new(self.inner.queue_capacity));
        self.inner.routes.write().insert(
            id,
            Route {
                filter: filter.to_string(),
                slot: index,
                queue: queue.clone(),
            },
        );

        debug!(%id, slot = index, "Relay subscription added");
        Ok(EventStream {
            id,
            filter: filter.to_string(),
            qos,
            queue,
        })
    }

    /// End a subscription; the broker-side filter is removed with its last user
    ///
    /// Local state is always cleaned up, even when the broker call fails.
    /// The release runs on its own task, so it completes even if the caller
    /// stops waiting.
    #[instrument(skip(self))]
    pub async fn unsubscribe(&self, id: Uuid) -> Result<(), RelayError> {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.release(id).await })
            .await
            .map_err(|e| RelayError::Connection(format!("unsubscribe task failed: {}", e)))?
    }

    /// Publish one message; never retried
    #[instrument(skip(self, payload), fields(bytes = payload.len()))]
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<PublishAck, RelayError> {
        if !self.is_enabled() {
            return Err(RelayError::Disabled);
        }
        topic::validate_topic(topic)?;

        let index = self.next_publish.fetch_add(1, Ordering::Relaxed) % self.inner.slots.len();
        let slot = &self.inner.slots[index];
        let _checkout = slot.write.lock().await;
        with_deadline(slot.link.publish(topic, payload, qos, retain)).await?;

        Ok(PublishAck {
            topic: topic.to_string(),
            qos,
            retain,
            connection: index,
            published_at: Utc::now(),
        })
    }

    /// Close every queue and connection
    pub async fn shutdown(&self) {
        let routes: Vec<Route> = self.inner.routes.write().drain().map(|(_, r)| r).collect();
        for route in routes {
            route.queue.close(CloseReason::Shutdown);
        }
        for slot in &self.inner.slots {
            slot.filters.lock().clear();
            if let Err(e) = slot.link.disconnect().await {
                debug!(error = %e, "Relay disconnect failed");
            }
        }
        for handle in self.dispatchers.lock().drain(..) {
            handle.abort();
        }
    }
}

impl RelayInner {
    async fn release(&self, id: Uuid) -> Result<(), RelayError> {
        let route = self
            .routes
            .write()
            .remove(&id)
            .ok_or_else(|| RelayError::UnknownSubscription(id.to_string()))?;
        route.queue.close(CloseReason::Unsubscribed);

        let slot = &self.slots[route.slot];
        let _checkout = slot.write.lock().await;
        let last_user = {
            let mut filters = slot.filters.lock();
            match filters.get_mut(&route.filter) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    false
                }
                Some(_) => {
                    filters.remove(&route.filter);
                    true
                }
                None => false,
            }
        };

        if last_user {
            if let Err(e) = with_deadline(slot.link.unsubscribe(&route.filter)).await {
                warn!(filter = %route.filter, error = %e, "Broker-side unsubscribe failed");
                return Err(e);
            }
        }
        debug!(%id, filter = %route.filter, "Relay subscription removed");
        Ok(())
    }

    /// Slot already carrying `filter`, else the least loaded one
    fn pick_slot(&self, filter: &str) -> usize {
        let mut best = 0;
        let mut best_load = usize::MAX;
        for (index, slot) in self.slots.iter().enumerate() {
            let filters = slot.filters.lock();
            if filters.contains_key(filter) {
                return index;
            }
            if filters.len() < best_load {
                best_load = filters.len();
                best = index;
            }
        }
        best
    }

    fn route(&self, slot: usize, message: InboundMessage) {
        let routes = self.routes.read();
        for (id, route) in routes.iter() {
            if route.slot == slot && topic::matches(&route.filter, &message.topic) {
                if route.queue.push(message.clone()) == PushOutcome::DroppedOldest {
                    debug!(%id, filter = %route.filter, "Subscription queue full; dropped oldest");
                }
            }
        }
    }

    /// Re-issue one subscribe per active filter on `slot`
    async fn restore(&self, index: usize) {
        let slot = &self.slots[index];
        let _checkout = slot.write.lock().await;
        let filters: Vec<(String, QoS)> = slot
            .filters
            .lock()
            .iter()
            .map(|(filter, entry)| (filter.clone(), entry.qos))
            .collect();

        info!(slot = index, filters = filters.len(), "Restoring relay subscriptions");
        for (filter, qos) in filters {
            if let Err(e) = with_deadline(slot.link.subscribe(&filter, qos)).await {
                error!(slot = index, filter = %filter, error = %e, "Could not restore subscription");
                self.drop_filter(index, &filter, &e.to_string());
            }
        }
    }

    fn drop_filter(&self, index: usize, filter: &str, reason: &str) {
        self.slots[index].filters.lock().remove(filter);
        let mut routes = self.routes.write();
        routes.retain(|_, route| {
            let lost = route.slot == index && route.filter == filter;
            if lost {
                route
                    .queue
                    .close(CloseReason::BrokerLost(reason.to_string()));
            }
            !lost
        });
    }
}

async fn dispatch(inner: Arc<RelayInner>, slot: usize, mut events: mpsc::Receiver<LinkEvent>) {
    let mut sessions = 0u64;
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Message(message) => inner.route(slot, message),
            LinkEvent::Connected => {
                sessions += 1;
                if sessions > 1 {
                    inner.restore(slot).await;
                }
            }
            LinkEvent::Disconnected(reason) => {
                warn!(slot, reason = %reason, "Relay connection down");
            }
        }
    }
    debug!(slot, "Relay dispatcher stopped");
}

async fn with_deadline<F>(operation: F) -> Result<(), RelayError>
where
    F: Future<Output = Result<(), RelayError>>,
{
    match tokio::time::timeout(OPERATION_TIMEOUT, operation).await {
        Ok(result) => result,
        Err(_) => Err(RelayError::Timeout(OPERATION_TIMEOUT.as_millis() as u64)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Link whose SUBSCRIBE always fails with a fixed error
    struct FailingLink {
        error: RelayError,
        unsubscribed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MqttLink for FailingLink {
        async fn subscribe(&self, _filter: &str, _qos: QoS) -> Result<(), RelayError> {
            Err(self.error.clone())
        }

        async fn unsubscribe(&self, filter: &str) -> Result<(), RelayError> {
            self.unsubscribed.lock().push(filter.to_string());
            Ok(())
        }

        async fn publish(&self, _: &str, _: Vec<u8>, _: QoS, _: bool) -> Result<(), RelayError> {
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), RelayError> {
            Ok(())
        }
    }

    struct FailingConnector(Arc<FailingLink>);

    #[async_trait]
    impl MqttConnector for FailingConnector {
        async fn connect(
            &self,
            _slot: usize,
        ) -> Result<(Arc<dyn MqttLink>, mpsc::Receiver<LinkEvent>), RelayError> {
            let (_tx, rx) = mpsc::channel(1);
            Ok((self.0.clone(), rx))
        }
    }

    async fn failing_relay(error: RelayError) -> (MqttRelay, Arc<FailingLink>) {
        let link = Arc::new(FailingLink {
            error,
            unsubscribed: Mutex::new(Vec::new()),
        });
        let relay = MqttRelay::connect(Arc::new(FailingConnector(link.clone())), 1, 8)
            .await
            .unwrap();
        (relay, link)
    }

    #[tokio::test]
    async fn test_lost_subscribe_is_withdrawn() {
        let (relay, link) = failing_relay(RelayError::Connection("reset".into())).await;
        assert!(relay.subscribe("t/#", QoS::AtLeastOnce).await.is_err());
        assert_eq!(*link.unsubscribed.lock(), vec!["t/#".to_string()]);
        assert_eq!(relay.broker_filter_count(), 0);
        assert_eq!(relay.route_count(), 0);
    }

    #[tokio::test]
    async fn test_refused_subscribe_is_not_withdrawn() {
        let (relay, link) = failing_relay(RelayError::Rejected("not authorized".into())).await;
        assert!(matches!(
            relay.subscribe("t/#", QoS::AtLeastOnce).await,
            Err(RelayError::Rejected(_))
        ));
        assert!(link.unsubscribed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_relay() {
        let relay = MqttRelay::disabled();
        assert!(!relay.is_enabled());
        assert_eq!(
            relay.subscribe("t/#", QoS::AtMostOnce).await.unwrap_err(),
            RelayError::Disabled
        );
        assert_eq!(
            relay
                .publish("t/1", b"x".to_vec(), QoS::AtMostOnce, false)
                .await
                .unwrap_err(),
            RelayError::Disabled
        );
    }

    #[tokio::test]
    async fn test_unknown_unsubscribe() {
        let relay = MqttRelay::disabled();
        assert!(matches!(
            relay.unsubscribe(Uuid::new_v4()).await,
            Err(RelayError::UnknownSubscription(_))
        ));
    }
}
