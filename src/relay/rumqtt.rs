//! `rumqttc`-backed relay connections
//!
//! Each connection owns an event loop task. `rumqttc` reconnects on the next
//! poll after an error; the task spaces those polls with exponential backoff
//! and reports `Connected` on every CONNACK so the relay can restore filters.
//!
//! `AsyncClient` only queues requests. A link call waits for the broker's
//! answer instead: the event loop reports the packet id of each outgoing
//! SUBSCRIBE, UNSUBSCRIBE and PUBLISH, and the matching SUBACK, UNSUBACK,
//! PUBACK or PUBCOMP completes the waiting call. A refused SUBACK becomes
//! [`RelayError::Rejected`].

use crate::backoff::{Backoff, RetryPolicy};
use crate::config::BridgeConfig;
use crate::error::RelayError;
use crate::relay::link::{LinkEvent, MqttConnector, MqttLink};
use crate::relay::message::{InboundMessage, QoS};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, SubscribeReasonCode};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

impl From<rumqttc::QoS> for QoS {
    fn from(qos: rumqttc::QoS) -> Self {
        match qos {
            rumqttc::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Connector producing `rumqttc` connections
#[derive(Debug, Clone)]
pub struct RumqttConnector {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    client_prefix: String,
    reconnect: RetryPolicy,
}

impl RumqttConnector {
    /// Build from bridge configuration; fails when no MQTT URL is set
    pub fn from_config(config: &BridgeConfig) -> Result<Self, RelayError> {
        let raw = config.mqtt_url.as_deref().ok_or(RelayError::Disabled)?;
        let url = Url::parse(raw).map_err(|e| RelayError::Connection(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| RelayError::Connection(format!("no host in {}", raw)))?
            .to_string();

        Ok(Self {
            host,
            port: url.port().unwrap_or(1883),
            username: config
                .mqtt_username
                .clone()
                .or_else(|| Some(url.username().to_string()).filter(|u| !u.is_empty())),
            password: config
                .mqtt_password
                .clone()
                .or_else(|| url.password().map(str::to_string)),
            client_prefix: config.mqtt_client_prefix.clone(),
            reconnect: RetryPolicy::new(u32::MAX, config.retry_base, config.retry_max),
        })
    }

    fn options(&self, slot: usize) -> MqttOptions {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}-{}", self.client_prefix, slot, &suffix[..8]);
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        if let Some(ref username) = self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

#[async_trait]
impl MqttConnector for RumqttConnector {
    async fn connect(
        &self,
        slot: usize,
    ) -> Result<(Arc<dyn MqttLink>, mpsc::Receiver<LinkEvent>), RelayError> {
        let (client, eventloop) = AsyncClient::new(self.options(slot), REQUEST_CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let acks = Arc::new(AckTracker::default());

        info!(slot, host = %self.host, port = self.port, "Opening relay MQTT connection");
        tokio::spawn(drive(
            eventloop,
            tx,
            acks.clone(),
            Backoff::new(self.reconnect),
            slot,
        ));

        Ok((Arc::new(RumqttLink { client, acks }), rx))
    }
}

/// Which acknowledgement a request waits for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AckKind {
    Subscribe,
    Unsubscribe,
    Publish,
}

type AckReply = oneshot::Sender<Result<(), RelayError>>;

struct Waiter {
    target: String,
    reply: AckReply,
}

#[derive(Default)]
struct AckState {
    /// Requests handed to the client whose packet id is not known yet
    queued: HashMap<AckKind, VecDeque<Waiter>>,
    /// Requests on the wire, by packet id
    in_flight: HashMap<(AckKind, u16), Waiter>,
}

/// Pairs outgoing packet ids with the link calls that produced them
///
/// The relay serializes writes on a link, and the event loop sends requests
/// of one kind in the order they were queued, so the oldest queued waiter of
/// a kind owns the next outgoing packet of that kind.
#[derive(Default)]
struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    fn register(&self, kind: AckKind, target: &str) -> oneshot::Receiver<Result<(), RelayError>> {
        let (reply, rx) = oneshot::channel();
        self.state
            .lock()
            .queued
            .entry(kind)
            .or_default()
            .push_back(Waiter {
                target: target.to_string(),
                reply,
            });
        rx
    }

    /// Forget the newest waiter of `kind`; its request never reached the client
    fn withdraw(&self, kind: AckKind) {
        if let Some(queue) = self.state.lock().queued.get_mut(&kind) {
            queue.pop_back();
        }
    }

    /// The event loop wrote a packet of `kind` with `pkid`
    fn sent(&self, kind: AckKind, pkid: u16) {
        let mut state = self.state.lock();
        if let Some(current) = state.in_flight.get(&(kind, pkid)) {
            if !current.reply.is_closed() {
                // Retransmission after reconnect
                return;
            }
            state.in_flight.remove(&(kind, pkid));
        }
        let Some(waiter) = state.queued.get_mut(&kind).and_then(VecDeque::pop_front) else {
            return;
        };
        if pkid == 0 {
            // QoS 0 publish: nothing further comes back
            let _ = waiter.reply.send(Ok(()));
        } else {
            state.in_flight.insert((kind, pkid), waiter);
        }
    }

    /// The broker answered packet `pkid`
    fn acked(&self, kind: AckKind, pkid: u16, refused: bool) {
        let Some(waiter) = self.state.lock().in_flight.remove(&(kind, pkid)) else {
            return;
        };
        let result = if refused {
            Err(RelayError::Rejected(format!("broker refused {}", waiter.target)))
        } else {
            Ok(())
        };
        let _ = waiter.reply.send(result);
    }
}

async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::Sender<LinkEvent>,
    acks: Arc<AckTracker>,
    mut backoff: Backoff,
    slot: usize,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                debug!(slot, "Relay connection established");
                LinkEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => LinkEvent::Message(InboundMessage::new(
                publish.topic.clone(),
                publish.payload.to_vec(),
                publish.qos.into(),
                publish.retain,
            )),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let refused = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if refused {
                    warn!(slot, pkid = ack.pkid, "Broker refused a relay subscription");
                }
                acks.acked(AckKind::Subscribe, ack.pkid, refused);
                continue;
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                acks.acked(AckKind::Unsubscribe, ack.pkid, false);
                continue;
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                acks.acked(AckKind::Publish, ack.pkid, false);
                continue;
            }
            Ok(Event::Incoming(Packet::PubComp(ack))) => {
                acks.acked(AckKind::Publish, ack.pkid, false);
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.sent(AckKind::Subscribe, pkid);
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                acks.sent(AckKind::Unsubscribe, pkid);
                continue;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                acks.sent(AckKind::Publish, pkid);
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    slot,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Relay connection lost; reconnecting"
                );
                if events.send(LinkEvent::Disconnected(e.to_string())).await.is_err() {
                    break;
                }
                tokio::time::sleep(delay).await;
                continue;
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
    debug!(slot, "Relay event loop stopped");
}

struct RumqttLink {
    client: AsyncClient,
    acks: Arc<AckTracker>,
}

fn client_error(err: rumqttc::ClientError) -> RelayError {
    RelayError::Connection(err.to_string())
}

impl RumqttLink {
    /// Queue one request and wait for the broker's acknowledgement of it
    async fn acknowledged<F>(&self, kind: AckKind, target: &str, request: F) -> Result<(), RelayError>
    where
        F: Future<Output = Result<(), rumqttc::ClientError>>,
    {
        let ack = self.acks.register(kind, target);
        if let Err(e) = request.await {
            self.acks.withdraw(kind);
            return Err(client_error(e));
        }
        ack.await
            .map_err(|_| RelayError::Connection("relay event loop stopped".to_string()))?
    }
}

#[async_trait]
impl MqttLink for RumqttLink {
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), RelayError> {
        self.acknowledged(
            AckKind::Subscribe,
            &format!("subscription to {}", filter),
            self.client.subscribe(filter, qos.into()),
        )
        .await
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), RelayError> {
        self.acknowledged(
            AckKind::Unsubscribe,
            &format!("unsubscribe from {}", filter),
            self.client.unsubscribe(filter),
        )
        .await
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RelayError> {
        self.acknowledged(
            AckKind::Publish,
            &format!("publish to {}", topic),
            self.client.publish(topic, qos.into(), retain, payload),
        )
        .await
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        self.client.disconnect().await.map_err(client_error)
    }
}
