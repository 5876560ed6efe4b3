//! Connection seam between the relay and an MQTT client implementation

use crate::error::RelayError;
use crate::relay::message::{InboundMessage, QoS};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Events emitted by one live connection
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Session (re-)established; broker-side subscriptions must be restored
    Connected,
    /// Connection dropped; the transport is reconnecting
    Disconnected(String),
    /// Application message
    Message(InboundMessage),
}

/// Write side of one MQTT connection
#[async_trait]
pub trait MqttLink: Send + Sync {
    /// Subscribe to a filter
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), RelayError>;

    /// Remove a filter
    async fn unsubscribe(&self, filter: &str) -> Result<(), RelayError>;

    /// Publish one message
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), RelayError>;

    /// Close the connection
    async fn disconnect(&self) -> Result<(), RelayError>;
}

/// Opens relay connections
#[async_trait]
pub trait MqttConnector: Send + Sync {
    /// Open connection number `slot`; events arrive on the returned receiver
    async fn connect(
        &self,
        slot: usize,
    ) -> Result<(Arc<dyn MqttLink>, mpsc::Receiver<LinkEvent>), RelayError>;
}
