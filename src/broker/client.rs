//! Authenticated management API client
//!
//! Every call goes through three layers:
//!
//! ```text
//! call ──▶ retry loop (GET only) ──▶ auth replay (once on 401/403) ──▶ deadline + pool permit ──▶ transport
//! ```

use crate::backoff::RetryPolicy;
use crate::broker::auth::{AuthToken, BrokerSession, RefreshCause, TokenSnapshot};
use crate::broker::transport::{BrokerTransport, HttpMethod, HttpRequest, HttpResponse, ReqwestTransport};
use crate::config::{AuthMode, BridgeConfig};
use crate::error::BrokerError;
use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, instrument, warn};
use url::Url;

/// Lifetime assumed for dashboard login tokens
const BEARER_TOKEN_TTL_MINUTES: i64 = 55;

/// A management API request relative to the base URL
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Method
    pub method: HttpMethod,
    /// Path segments appended to the base URL (percent-encoded on build)
    pub segments: Vec<String>,
    /// Query parameters
    pub query: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Value>,
}

impl ApiRequest {
    /// GET request
    pub fn get<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(HttpMethod::Get, segments)
    }

    /// POST request
    pub fn post<I, S>(segments: I, body: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut req = Self::new(HttpMethod::Post, segments);
        req.body = Some(body);
        req
    }

    /// DELETE request
    pub fn delete<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(HttpMethod::Delete, segments)
    }

    fn new<I, S>(method: HttpMethod, segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            method,
            segments: segments.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Attach query parameters
    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    /// `/a/b` form for logging
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }
}

/// Client for the EMQX management API
pub struct BrokerClient {
    transport: Arc<dyn BrokerTransport>,
    base: Url,
    api_key: String,
    api_secret: String,
    auth_mode: AuthMode,
    session: BrokerSession,
    permits: Semaphore,
    timeout: Duration,
    retry: RetryPolicy,
    closed: AtomicBool,
}

impl BrokerClient {
    /// Create a client using the `reqwest` transport
    pub fn new(config: &BridgeConfig) -> Result<Self, BrokerError> {
        let transport = ReqwestTransport::new(config.http_pool_size, config.request_timeout)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over an arbitrary transport
    pub fn with_transport(
        config: &BridgeConfig,
        transport: Arc<dyn BrokerTransport>,
    ) -> Result<Self, BrokerError> {
        let base = Url::parse(config.api_url.trim_end_matches('/'))
            .map_err(|e| BrokerError::Network(format!("invalid API URL: {}", e)))?;
        if base.cannot_be_a_base() {
            return Err(BrokerError::Network(format!(
                "invalid API URL: {}",
                config.api_url
            )));
        }

        Ok(Self {
            transport,
            base,
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            auth_mode: config.auth_mode,
            session: BrokerSession::new(),
            permits: Semaphore::new(config.http_pool_size.max(1)),
            timeout: config.request_timeout,
            retry: RetryPolicy::new(config.max_retries, config.retry_base, config.retry_max),
            closed: AtomicBool::new(false),
        })
    }

    /// Shared auth state
    pub fn session(&self) -> &BrokerSession {
        &self.session
    }

    /// Perform a call with retries and auth replay
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path()))]
    pub async fn call(&self, request: ApiRequest) -> Result<Value, BrokerError> {
        let idempotent = request.method.is_idempotent();
        let mut attempt = 0;

        loop {
            match self.call_authenticated(&request).await {
                Ok(value) => return Ok(value),
                Err(e) if idempotent && e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying idempotent management API call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if !idempotent && e.is_transient() {
                        warn!(error = %e, "Non-idempotent call failed; not retrying");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Force a new token to be obtained
    pub async fn refresh_auth(&self) -> Result<(), BrokerError> {
        self.session
            .refresh(RefreshCause::Forced, || self.obtain_token())
            .await
            .map(|_| ())
    }

    /// Close the client; later calls fail with [`BrokerError::Closed`]
    ///
    /// Calling this more than once is harmless.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.permits.close();
            self.session.clear().await;
            debug!("Broker client closed");
        }
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call_authenticated(&self, request: &ApiRequest) -> Result<Value, BrokerError> {
        let snapshot = self.current_token().await?;
        let response = self.send(request, &snapshot).await?;
        if !is_auth_failure(response.status) {
            return interpret(request, response);
        }

        warn!(status = response.status, "Broker rejected credentials; refreshing");
        let refreshed = self
            .session
            .refresh(RefreshCause::Rejected(snapshot.generation), || {
                self.obtain_token()
            })
            .await?;
        let response = self.send(request, &refreshed).await?;
        if is_auth_failure(response.status) {
            error!(status = response.status, "Broker rejected refreshed credentials");
            return Err(BrokerError::Auth {
                status: response.status,
                message: response.body,
            });
        }
        interpret(request, response)
    }

    async fn current_token(&self) -> Result<TokenSnapshot, BrokerError> {
        if let Some(snapshot) = self.session.snapshot().await {
            return Ok(snapshot);
        }
        self.session
            .refresh(RefreshCause::Missing, || self.obtain_token())
            .await
    }

    async fn obtain_token(&self) -> Result<AuthToken, BrokerError> {
        match self.auth_mode {
            AuthMode::Basic => Ok(AuthToken::basic(&self.api_key, &self.api_secret)),
            AuthMode::Bearer => self.login().await,
        }
    }

    async fn login(&self) -> Result<AuthToken, BrokerError> {
        let request = HttpRequest {
            method: HttpMethod::Post,
            url: self.build_url(&["login".to_string()], &[])?,
            authorization: None,
            body: Some(json!({
                "username": self.api_key,
                "password": self.api_secret,
            })),
        };
        let response = self.exchange(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(BrokerError::Login(format!(
                "{} - {}",
                response.status, response.body
            )));
        }
        let body: Value = serde_json::from_str(&response.body)
            .map_err(|e| BrokerError::Login(format!("invalid login response: {}", e)))?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Login("login response has no token".to_string()))?;
        Ok(AuthToken::bearer(
            token,
            ChronoDuration::minutes(BEARER_TOKEN_TTL_MINUTES),
        ))
    }

    async fn send(
        &self,
        request: &ApiRequest,
        snapshot: &TokenSnapshot,
    ) -> Result<HttpResponse, BrokerError> {
        let http = HttpRequest {
            method: request.method,
            url: self.build_url(&request.segments, &request.query)?,
            authorization: Some(snapshot.token.header().to_string()),
            body: request.body.clone(),
        };
        self.exchange(http).await
    }

    async fn exchange(&self, request: HttpRequest) -> Result<HttpResponse, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BrokerError::Closed)?;

        match tokio::time::timeout(self.timeout, self.transport.send(request)).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    fn build_url(&self, segments: &[String], query: &[(String, String)]) -> Result<Url, BrokerError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::Network("API URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }
}

fn is_auth_failure(status: u16) -> bool {
    status == 401 || status == 403
}

/// Turn a raw response into JSON or a typed error
fn interpret(request: &ApiRequest, response: HttpResponse) -> Result<Value, BrokerError> {
    let HttpResponse { status, body } = response;
    match status {
        200..=299 => {
            if body.trim().is_empty() {
                return Ok(json!({}));
            }
            Ok(serde_json::from_str(&body).unwrap_or_else(|_| json!({ "raw": body })))
        }
        404 => Err(BrokerError::NotFound(if body.is_empty() {
            request.path()
        } else {
            body
        })),
        400 => Err(BrokerError::BadRequest(body)),
        500..=599 => {
            error!(status, body = %body, "EMQX API server error");
            Err(BrokerError::Server {
                status,
                message: body,
            })
        }
        _ => {
            error!(status, body = %body, "Unexpected EMQX API response");
            Err(BrokerError::Unexpected {
                status,
                message: body,
            })
        }
    }
}
