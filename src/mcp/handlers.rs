//! Tool handlers
//!
//! Handlers only orchestrate: each one reads its validated parameters and
//! makes one call into the broker client, the relay, or the session manager.

use crate::broker::{BrokerClient, PublishRequest};
use crate::error::{Result, ValidationError};
use crate::mcp::tools::Params;
use crate::relay::{topic, MqttRelay, QoS};
use crate::session::{McpSession, SessionManager};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;

/// Everything a handler may touch
#[derive(Clone)]
pub struct ToolContext {
    /// Management API client
    pub broker: Arc<BrokerClient>,
    /// MQTT relay
    pub relay: Arc<MqttRelay>,
    /// Session registry
    pub sessions: Arc<SessionManager>,
    /// Session issuing the call
    pub session: Arc<McpSession>,
}

/// Handler entry in the dispatch table
pub type Handler = fn(ToolContext, Params) -> BoxFuture<'static, Result<Value>>;

fn qos(params: &Params, name: &str) -> Result<QoS> {
    let level = params.int(name)?;
    u8::try_from(level)
        .ok()
        .and_then(|level| QoS::try_from(level).ok())
        .ok_or_else(|| {
            ValidationError::NotInEnum {
                field: name.to_string(),
                value: level.to_string(),
                allowed: "0, 1, 2".to_string(),
            }
            .into()
        })
}

pub(crate) fn publish_mqtt_message(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let topic_name = params.str("topic")?;
        let payload = params.str("payload")?;
        let qos = qos(&params, "qos")?;
        let retain = params.bool("retain")?;
        topic::validate_topic(topic_name)?;

        if params.str("transport")? == "mqtt" {
            let ack = ctx
                .relay
                .publish(topic_name, payload.as_bytes().to_vec(), qos, retain)
                .await?;
            return Ok(serde_json::to_value(ack)?);
        }

        let request = PublishRequest {
            topic: topic_name.to_string(),
            payload: payload.to_string(),
            qos: qos.level(),
            retain,
        };
        Ok(ctx.broker.publish(&request).await?)
    }
    .boxed()
}

pub(crate) fn list_mqtt_clients(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move { Ok(ctx.broker.list_clients(params.to_query()).await?) }.boxed()
}

pub(crate) fn get_mqtt_client(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let client_id = params.str("clientid")?;
        Ok(ctx.broker.get_client(client_id).await?)
    }
    .boxed()
}

pub(crate) fn kick_mqtt_client(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let client_id = params.str("clientid")?;
        Ok(ctx.broker.kick_client(client_id).await?)
    }
    .boxed()
}

pub(crate) fn list_mqtt_subscriptions(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move { Ok(ctx.broker.list_subscriptions(params.to_query()).await?) }.boxed()
}

pub(crate) fn list_mqtt_topics(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move { Ok(ctx.broker.list_topics(params.to_query()).await?) }.boxed()
}

pub(crate) fn get_broker_stats(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let aggregate = params.bool("aggregate")?;
        Ok(ctx.broker.stats(aggregate).await?)
    }
    .boxed()
}

pub(crate) fn subscribe_mqtt_topic(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let filter = params.str("topic")?;
        let qos = qos(&params, "qos")?;
        let info = ctx.sessions.subscribe(&ctx.session, filter, qos).await?;
        Ok(serde_json::to_value(info)?)
    }
    .boxed()
}

pub(crate) fn unsubscribe_mqtt_topic(ctx: ToolContext, params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let filter = params.str("topic")?;
        let info = ctx.sessions.untrack_subscription(&ctx.session, filter).await?;
        Ok(json!({
            "success": true,
            "subscriptionId": info.id,
            "topic": info.topic,
        }))
    }
    .boxed()
}

pub(crate) fn list_active_subscriptions(ctx: ToolContext, _params: Params) -> BoxFuture<'static, Result<Value>> {
    async move {
        let subscriptions = ctx.session.subscriptions();
        Ok(json!({
            "count": subscriptions.len(),
            "subscriptions": subscriptions,
        }))
    }
    .boxed()
}
