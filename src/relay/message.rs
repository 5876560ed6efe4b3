//! Messages flowing through the relay

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// MQTT quality-of-service level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum QoS {
    /// Fire and forget
    AtMostOnce = 0,
    /// Acknowledged delivery
    AtLeastOnce = 1,
    /// Assured single delivery
    ExactlyOnce = 2,
}

impl QoS {
    /// Numeric level
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos.level()
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("Invalid QoS value: {}. Must be 0, 1, or 2", other)),
        }
    }
}

/// One message received from the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Concrete topic the message was published to
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
    /// Delivery QoS
    pub qos: QoS,
    /// Retained flag
    pub retain: bool,
    /// When the relay received it
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Build a message stamped with the current time
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            received_at: Utc::now(),
        }
    }

    /// JSON form: UTF-8 payloads are sent as text, anything else as base64
    pub fn to_json(&self) -> Value {
        let (payload, encoding) = match std::str::from_utf8(&self.payload) {
            Ok(text) => (text.to_string(), "utf8"),
            Err(_) => (
                base64::engine::general_purpose::STANDARD.encode(&self.payload),
                "base64",
            ),
        };
        json!({
            "topic": self.topic,
            "payload": payload,
            "encoding": encoding,
            "qos": self.qos.level(),
            "retain": self.retain,
            "receivedAt": self.received_at.to_rfc3339(),
        })
    }
}

/// A message popped from a subscription queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// The message
    pub message: InboundMessage,
    /// 1-based position in this subscription's delivery order
    pub sequence: u64,
    /// Messages were dropped since the previous delivery
    pub lossy: bool,
    /// How many were dropped since the previous delivery
    pub dropped: u64,
}
