//! Typed EMQX management API operations
//!
//! Thin wrappers over [`BrokerClient::call`] naming the v5 endpoints the
//! bridge uses. Retry behaviour follows the HTTP method: list/get/stats are
//! GETs and may be retried; publish and kick are never replayed.

use crate::broker::client::{ApiRequest, BrokerClient};
use crate::error::BrokerError;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

/// Body of `POST /publish`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishRequest {
    /// Target topic
    pub topic: String,
    /// Message payload
    pub payload: String,
    /// QoS level
    pub qos: u8,
    /// Retain flag
    pub retain: bool,
}

/// Query parameters for list endpoints, in insertion order
pub type Query = Vec<(String, String)>;

impl BrokerClient {
    /// Publish one message through the HTTP API
    pub async fn publish(&self, message: &PublishRequest) -> Result<Value, BrokerError> {
        info!(topic = %message.topic, qos = message.qos, "Publishing message via management API");
        let body = serde_json::to_value(message).map_err(|e| BrokerError::Decode(e.to_string()))?;
        self.call(ApiRequest::post(["publish"], body)).await
    }

    /// `GET /clients`
    pub async fn list_clients(&self, query: Query) -> Result<Value, BrokerError> {
        self.call(ApiRequest::get(["clients"]).with_query(query)).await
    }

    /// `GET /clients/{clientid}`
    pub async fn get_client(&self, client_id: &str) -> Result<Value, BrokerError> {
        self.call(ApiRequest::get(["clients", client_id])).await
    }

    /// `DELETE /clients/{clientid}`
    pub async fn kick_client(&self, client_id: &str) -> Result<Value, BrokerError> {
        info!(client_id, "Disconnecting client");
        self.call(ApiRequest::delete(["clients", client_id])).await?;
        Ok(json!({
            "success": true,
            "message": format!("Client {} has been disconnected", client_id),
        }))
    }

    /// `GET /subscriptions`
    pub async fn list_subscriptions(&self, query: Query) -> Result<Value, BrokerError> {
        self.call(ApiRequest::get(["subscriptions"]).with_query(query))
            .await
    }

    /// `GET /topics`
    pub async fn list_topics(&self, query: Query) -> Result<Value, BrokerError> {
        self.call(ApiRequest::get(["topics"]).with_query(query)).await
    }

    /// `GET /stats`
    pub async fn stats(&self, aggregate: bool) -> Result<Value, BrokerError> {
        let query = vec![("aggregate".to_string(), aggregate.to_string())];
        self.call(ApiRequest::get(["stats"]).with_query(query)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_request_shape() {
        let req = PublishRequest {
            topic: "t/1".into(),
            payload: "hello".into(),
            qos: 1,
            retain: false,
        };
        assert_eq!(
            serde_json::to_value(&req).unwrap(),
            json!({"topic": "t/1", "payload": "hello", "qos": 1, "retain": false})
        );
    }
}
