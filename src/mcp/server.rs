//! MCP server implementation
//!
//! One connection loop per client, over line-delimited JSON-RPC. Each loop
//! attaches a session, reads requests, and hands every `tools/call` and
//! resources subscribe/unsubscribe to its own task so `notifications/cancelled`
//! and other requests can still be read while it runs. A
//! writer task serializes everything sent back to the client. When the input
//! ends the session is detached, which releases its subscriptions.

use crate::error::{Error, McpError, Result};
use crate::mcp::dispatch::ToolDispatcher;
use crate::mcp::types::{
    CancelledParams, JsonRpcRequest, JsonRpcResponse, McpCapabilities, McpResource,
    McpServerInfo, ResourceParams, ToolCallParams, ToolCallResult, PROTOCOL_VERSION,
};
use crate::relay::QoS;
use crate::session::{filter_from_uri, McpSession, SessionManager};
use crate::translate::translate;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of the per-connection outbound channel
const OUTBOUND_CAPACITY: usize = 1024;

/// MCP server state
pub struct McpServer {
    /// Tool dispatcher
    dispatcher: ToolDispatcher,
    /// Server info
    info: McpServerInfo,
}

impl McpServer {
    /// Create a new MCP server
    pub fn new(dispatcher: ToolDispatcher) -> Self {
        Self {
            dispatcher,
            info: McpServerInfo::default(),
        }
    }

    /// Server name and version
    pub fn info(&self) -> &McpServerInfo {
        &self.info
    }

    /// Session registry
    pub fn sessions(&self) -> &Arc<SessionManager> {
        self.dispatcher.sessions()
    }

    /// Serve a single client over stdin/stdout
    #[instrument(skip(self))]
    pub async fn run_stdio(self: Arc<Self>) -> Result<()> {
        info!(
            "Starting MCP server on stdio: {} v{}",
            self.info.name, self.info.version
        );
        self.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await?;
        info!("MCP server shutting down");
        Ok(())
    }

    /// Accept clients on a TCP listener, one session per connection
    #[instrument(skip(self))]
    pub async fn run_tcp(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(
            address = %listener.local_addr()?,
            "Starting MCP server on TCP: {} v{}",
            self.info.name,
            self.info.version
        );
        self.accept_loop(listener).await
    }

    /// Accept clients on an already bound listener
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "Client connected");
            let server = self.clone();
            tokio::spawn(async move {
                let (read, write) = stream.into_split();
                if let Err(e) = server.serve(BufReader::new(read), write).await {
                    warn!(%peer, error = %e, "Client connection failed");
                }
                debug!(%peer, "Client disconnected");
            });
        }
    }

    /// Run one client connection to completion
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = self.sessions().attach(tx);
        let writer_task = tokio::spawn(write_loop(writer, rx));

        let outcome = self.read_loop(&session, reader).await;

        self.sessions().detach(session.id()).await;
        drop(session);
        if let Err(e) = writer_task.await {
            debug!(error = %e, "Writer task ended abnormally");
        }
        outcome
    }

    async fn read_loop<R>(self: &Arc<Self>, session: &Arc<McpSession>, mut reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }

            let response = match std::str::from_utf8(&buf) {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(session_id = %session.id(), "Received: {}", line);
                    self.handle_line(session, line).await
                }
                Err(e) => {
                    warn!(session_id = %session.id(), error = %e, "Request is not valid UTF-8");
                    Some(JsonRpcResponse::parse_error())
                }
            };

            if let Some(response) = response {
                if !session.send(serde_json::to_value(&response)?).await {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Handle a single line of input
    async fn handle_line(
        self: &Arc<Self>,
        session: &Arc<McpSession>,
        line: &str,
    ) -> Option<JsonRpcResponse> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to parse request: {}", e);
                return Some(JsonRpcResponse::parse_error());
            }
        };
        if request.jsonrpc != "2.0" {
            return Some(JsonRpcResponse::invalid_request(request.id));
        }

        self.handle_request(session, request).await
    }

    /// Handle a JSON-RPC request
    #[instrument(skip(self, session, request), fields(session_id = %session.id(), method = %request.method))]
    pub async fn handle_request(
        self: &Arc<Self>,
        session: &Arc<McpSession>,
        request: JsonRpcRequest,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let method = request.method.as_str();

        let result = match method {
            // Lifecycle
            "initialize" => self.handle_initialize(request.params),
            "initialized" | "notifications/initialized" => return None,
            "shutdown" => {
                info!("Handling shutdown");
                Ok(Value::Null)
            }
            "ping" => Ok(json!({})),

            // Tools
            "tools/list" => Ok(json!({ "tools": self.dispatcher.definitions() })),
            "tools/call" => {
                self.spawn_tool_call(session, id, request.params);
                return None;
            }

            // Resources
            "resources/list" => Ok(self.handle_resources_list(session)),
            "resources/subscribe" | "resources/unsubscribe" => {
                self.spawn_resource_call(session, id, method, request.params);
                return None;
            }

            "notifications/cancelled" => {
                self.handle_cancelled(session, request.params);
                return None;
            }

            _ => {
                if request.id.is_none() {
                    debug!("Ignoring unknown notification");
                    return None;
                }
                warn!("Unknown method: {}", method);
                return Some(JsonRpcResponse::method_not_found(id, method));
            }
        };

        if id.is_none() {
            return None;
        }
        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(e) => JsonRpcResponse::bridge_error(id, &translate(&e, method)),
        })
    }

    fn handle_initialize(&self, params: Option<Value>) -> Result<Value> {
        if let Some(version) = params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
        {
            debug!("Client protocol version: {}", version);
        }

        Ok(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": McpCapabilities::default(),
            "serverInfo": self.info,
        }))
    }

    fn spawn_tool_call(
        self: &Arc<Self>,
        session: &Arc<McpSession>,
        id: Option<Value>,
        params: Option<Value>,
    ) {
        let Some(request_id) = id else {
            warn!("tools/call sent as a notification; ignoring");
            return;
        };

        let call: ToolCallParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(call)) => call,
            Ok(None) => {
                self.respond_error(session, request_id, McpError::InvalidParams("missing params".into()).into());
                return;
            }
            Err(e) => {
                self.respond_error(session, request_id, McpError::InvalidParams(e.to_string()).into());
                return;
            }
        };

        let invocation = match self.sessions().track_invocation(session, &request_id.to_string()) {
            Ok(invocation) => invocation,
            Err(e) => {
                self.respond_error(session, request_id, e);
                return;
            }
        };

        let server = self.clone();
        let session = session.clone();
        tokio::spawn(async move {
            let outcome = server
                .dispatcher
                .invoke(&call.name, call.arguments, &session, invocation.token().clone())
                .await;
            server.sessions().finish_invocation(&session, &invocation);

            let response = match outcome {
                Ok(value) => match serde_json::to_value(ToolCallResult::json(&value)) {
                    Ok(result) => JsonRpcResponse::success(Some(request_id), result),
                    Err(e) => JsonRpcResponse::bridge_error(
                        Some(request_id),
                        &translate(&Error::from(e), &call.name),
                    ),
                },
                Err(Error::Mcp(McpError::Cancelled)) => return,
                Err(e) => JsonRpcResponse::bridge_error(Some(request_id), &translate(&e, &call.name)),
            };
            match serde_json::to_value(&response) {
                Ok(message) => {
                    session.send(message).await;
                }
                Err(e) => error!(error = %e, "Failed to serialize tool response"),
            }
        });
    }

    /// Run a resources subscribe or unsubscribe off the read loop
    ///
    /// A relay subscribe waits for the broker, so it must not hold up the
    /// session's other requests.
    fn spawn_resource_call(
        self: &Arc<Self>,
        session: &Arc<McpSession>,
        id: Option<Value>,
        method: &str,
        params: Option<Value>,
    ) {
        let server = self.clone();
        let session = session.clone();
        let method = method.to_string();
        tokio::spawn(async move {
            let result = if method == "resources/subscribe" {
                server.handle_resources_subscribe(&session, params).await
            } else {
                server.handle_resources_unsubscribe(&session, params).await
            };
            if id.is_none() {
                return;
            }
            let response = match result {
                Ok(value) => JsonRpcResponse::success(id, value),
                Err(e) => JsonRpcResponse::bridge_error(id, &translate(&e, &method)),
            };
            if let Ok(message) = serde_json::to_value(&response) {
                session.send(message).await;
            }
        });
    }

    fn respond_error(&self, session: &Arc<McpSession>, id: Value, err: Error) {
        let response = JsonRpcResponse::bridge_error(Some(id), &translate(&err, "tools/call"));
        let session = session.clone();
        tokio::spawn(async move {
            if let Ok(message) = serde_json::to_value(&response) {
                session.send(message).await;
            }
        });
    }

    fn handle_resources_list(&self, session: &McpSession) -> Value {
        let resources: Vec<McpResource> = session
            .subscriptions()
            .into_iter()
            .map(|sub| McpResource {
                uri: sub.uri,
                name: sub.topic.clone(),
                description: Some(format!("Live MQTT messages matching {}", sub.topic)),
                mime_type: "application/json".to_string(),
            })
            .collect();
        json!({ "resources": resources })
    }

    async fn handle_resources_subscribe(
        &self,
        session: &Arc<McpSession>,
        params: Option<Value>,
    ) -> Result<Value> {
        let filter = resource_filter(params)?;
        self.sessions()
            .subscribe(session, &filter, QoS::AtMostOnce)
            .await?;
        Ok(json!({}))
    }

    async fn handle_resources_unsubscribe(
        &self,
        session: &Arc<McpSession>,
        params: Option<Value>,
    ) -> Result<Value> {
        let filter = resource_filter(params)?;
        self.sessions().untrack_subscription(session, &filter).await?;
        Ok(json!({}))
    }

    fn handle_cancelled(&self, session: &McpSession, params: Option<Value>) {
        let Some(cancelled) = params.and_then(|p| serde_json::from_value::<CancelledParams>(p).ok())
        else {
            debug!("Malformed cancellation notice");
            return;
        };
        let key = cancelled.request_id.to_string();
        if !self.sessions().cancel_invocation(session, &key) {
            debug!(request_id = %key, "Cancellation for unknown or finished request");
        }
    }
}

fn resource_filter(params: Option<Value>) -> Result<String> {
    let params: ResourceParams = serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| McpError::InvalidParams(e.to_string()))?;
    filter_from_uri(&params.uri)
        .map(str::to_string)
        .ok_or_else(|| McpError::InvalidParams(format!("Unsupported resource URI: {}", params.uri)).into())
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<Value>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize message: {}", e);
                continue;
            }
        };
        debug!("Sending: {}", line);
        line.push('\n');

        if let Err(e) = writer.write_all(line.as_bytes()).await {
            error!("Failed to write message: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            error!("Failed to flush output: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerClient, BrokerTransport, HttpRequest, HttpResponse};
    use crate::config::BridgeConfig;
    use crate::error::BrokerError;
    use crate::relay::MqttRelay;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl BrokerTransport for Unreachable {
        async fn send(&self, _request: HttpRequest) -> std::result::Result<HttpResponse, BrokerError> {
            Err(BrokerError::Network("unreachable".into()))
        }
    }

    fn server() -> Arc<McpServer> {
        let config = BridgeConfig::builder()
            .api_url("http://localhost:18083/api/v5")
            .credentials("key", "secret")
            .build();
        let broker = Arc::new(BrokerClient::with_transport(&config, Arc::new(Unreachable)).unwrap());
        let relay = Arc::new(MqttRelay::disabled());
        let sessions = Arc::new(SessionManager::new(relay.clone()));
        Arc::new(McpServer::new(ToolDispatcher::new(broker, relay, sessions)))
    }

    fn request(method: &str, params: Option<Value>, id: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
            id,
        }
    }

    fn session(server: &Arc<McpServer>) -> (Arc<McpSession>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(16);
        (server.sessions().attach(tx), rx)
    }

    #[tokio::test]
    async fn test_handle_ping() {
        let server = server();
        let (session, _rx) = session(&server);
        let response = server
            .handle_request(&session, request("ping", None, Some(json!(1))))
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({})));
    }

    #[tokio::test]
    async fn test_handle_initialize() {
        let server = server();
        let (session, _rx) = session(&server);
        let response = server
            .handle_request(
                &session,
                request(
                    "initialize",
                    Some(json!({"protocolVersion": "2024-11-05"})),
                    Some(json!(1)),
                ),
            )
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "emqx-mcp-bridge");
        assert_eq!(result["capabilities"]["resources"]["subscribe"], true);
    }

    #[tokio::test]
    async fn test_handle_tools_list() {
        let server = server();
        let (session, _rx) = session(&server);
        let response = server
            .handle_request(&session, request("tools/list", None, Some(json!(2))))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["tools"].as_array().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_handle_unknown_method() {
        let server = server();
        let (session, _rx) = session(&server);
        let response = server
            .handle_request(&session, request("unknown/method", None, Some(json!(3))))
            .await
            .unwrap();
        assert_eq!(response.error.unwrap().code, -32601);
    }

    #[tokio::test]
    async fn test_handle_notification() {
        let server = server();
        let (session, _rx) = session(&server);
        let response = server
            .handle_request(&session, request("notifications/initialized", None, None))
            .await;
        assert!(response.is_none());
    }

    #[tokio::test]
    async fn test_tool_call_answers_asynchronously() {
        let server = server();
        let (session, mut rx) = session(&server);
        let response = server
            .handle_request(
                &session,
                request(
                    "tools/call",
                    Some(json!({"name": "get_mqtt_client", "arguments": {}})),
                    Some(json!(9)),
                ),
            )
            .await;
        assert!(response.is_none());

        let message = rx.recv().await.unwrap();
        assert_eq!(message["id"], 9);
        assert_eq!(message["error"]["code"], -32602);
        assert!(message["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Missing required parameter: clientid"));
    }

    #[tokio::test]
    async fn test_resources_subscribe_without_relay() {
        let server = server();
        let (session, mut rx) = session(&server);
        let response = server
            .handle_request(
                &session,
                request(
                    "resources/subscribe",
                    Some(json!({"uri": "mqtt://subscription/t/#"})),
                    Some(json!(4)),
                ),
            )
            .await;
        assert!(response.is_none());

        let message = rx.recv().await.unwrap();
        assert_eq!(message["id"], 4);
        assert_eq!(message["error"]["code"], -32005);
        assert_eq!(message["error"]["data"]["retryable"], true);
    }

    #[tokio::test]
    async fn test_resources_subscribe_rejects_foreign_uri() {
        let server = server();
        let (session, mut rx) = session(&server);
        server
            .handle_request(
                &session,
                request(
                    "resources/subscribe",
                    Some(json!({"uri": "file:///etc/hosts"})),
                    Some(json!(5)),
                ),
            )
            .await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message["id"], 5);
        assert_eq!(message["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_resources_unsubscribe_unknown_filter() {
        let server = server();
        let (session, mut rx) = session(&server);
        server
            .handle_request(
                &session,
                request(
                    "resources/unsubscribe",
                    Some(json!({"uri": "mqtt://subscription/never/#"})),
                    Some(json!(6)),
                ),
            )
            .await;

        let message = rx.recv().await.unwrap();
        assert_eq!(message["id"], 6);
        assert!(message["error"].is_object());
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_is_a_parse_error() {
        let server = server();
        let (client, transport) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(transport);
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(BufReader::new(read), write).await }
        });

        let (client_read, mut client_write) = tokio::io::split(client);
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"\xff\"}\n")
            .await
            .unwrap();
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(client_read).lines();
        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["error"]["code"], -32700);
        let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second["id"], 2);
        assert_eq!(second["result"], json!({}));

        drop(lines);
        drop(client_write);
        serving.await.unwrap().unwrap();
    }
}
