//! HTTP transport seam for the management API
//!
//! [`BrokerClient`](super::BrokerClient) speaks to the broker through the
//! [`BrokerTransport`] trait so retry, auth and deadline handling can be
//! exercised without a live broker. [`ReqwestTransport`] is the production
//! implementation.

use crate::error::BrokerError;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// HTTP methods used by the management API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// Read-only, safe to retry
    Get,
    /// Creates or triggers something
    Post,
    /// Removes something
    Delete,
}

impl HttpMethod {
    /// Whether the bridge may replay this call on transient failure
    pub fn is_idempotent(self) -> bool {
        matches!(self, HttpMethod::Get)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => f.write_str("GET"),
            HttpMethod::Post => f.write_str("POST"),
            HttpMethod::Delete => f.write_str("DELETE"),
        }
    }
}

/// A fully resolved request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Method
    pub method: HttpMethod,
    /// Absolute URL including query
    pub url: Url,
    /// `Authorization` header value, if any
    pub authorization: Option<String>,
    /// JSON body
    pub body: Option<Value>,
}

/// Raw response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// Status code
    pub status: u16,
    /// Body text
    pub body: String,
}

impl HttpResponse {
    /// Convenience constructor
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Sends requests to the broker
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Perform one HTTP exchange; no retries, no auth handling
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BrokerError>;
}

/// `reqwest`-backed transport with a bounded idle pool
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    /// Build a transport keeping at most `pool_size` idle connections per host
    pub fn new(pool_size: usize, timeout: Duration) -> Result<Self, BrokerError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(pool_size)
            .timeout(timeout)
            .user_agent(concat!("emqx-mcp-bridge/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn map_error(&self, err: reqwest::Error) -> BrokerError {
        if err.is_timeout() {
            BrokerError::Timeout(self.timeout.as_millis() as u64)
        } else {
            BrokerError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl BrokerTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BrokerError> {
        debug!(method = %request.method, url = %request.url, "Sending management API request");

        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(request.url),
            HttpMethod::Post => self.client.post(request.url),
            HttpMethod::Delete => self.client.delete(request.url),
        };
        builder = builder.header(CONTENT_TYPE, "application/json");
        if let Some(auth) = request.authorization {
            builder = builder.header(AUTHORIZATION, auth);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.map_error(e))?;
        Ok(HttpResponse { status, body })
    }
}
