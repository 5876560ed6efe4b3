//! Shared test doubles for integration tests
//!
//! `FakeApi` stands in for the EMQX management API and `LoopbackBroker` for
//! the MQTT side: every link it hands out sees the messages published through
//! any other link whose filters match.

#![allow(dead_code)]

use async_trait::async_trait;
use emqx_mcp_bridge::broker::{BrokerClient, BrokerTransport, HttpMethod, HttpRequest, HttpResponse};
use emqx_mcp_bridge::config::{AuthMode, BridgeConfig};
use emqx_mcp_bridge::error::{BrokerError, RelayError};
use emqx_mcp_bridge::relay::{
    topic, InboundMessage, LinkEvent, MqttConnector, MqttLink, MqttRelay, QoS,
};
use emqx_mcp_bridge::{McpServer, SessionManager, ToolDispatcher};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Responder = dyn Fn(&HttpRequest) -> Result<HttpResponse, BrokerError> + Send + Sync;

/// Scripted management API
pub struct FakeApi {
    responder: Box<Responder>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl FakeApi {
    /// Answer every request with `responder`
    pub fn new<F>(responder: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> Result<HttpResponse, BrokerError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            responder: Box::new(responder),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Answer every request with `200 {}`
    pub fn ok() -> Arc<Self> {
        Self::new(|_| Ok(HttpResponse::new(200, "{}")))
    }

    /// Number of requests received
    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    /// Requests whose path ends with `suffix`
    pub fn calls_to(&self, method: HttpMethod, suffix: &str) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|r| r.method == method && r.url.path().ends_with(suffix))
            .count()
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait]
impl BrokerTransport for FakeApi {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BrokerError> {
        let response = (self.responder)(&request);
        self.seen.lock().push(request);
        response
    }
}

struct LinkState {
    events: mpsc::Sender<LinkEvent>,
    filters: HashSet<String>,
}

/// In-memory MQTT broker shared by every link it creates
#[derive(Default)]
pub struct LoopbackBroker {
    links: Mutex<Vec<LinkState>>,
    subscribes: AtomicUsize,
    unsubscribes: AtomicUsize,
    publishes: AtomicUsize,
    fail_subscribe: AtomicBool,
    suback_delay: Mutex<Duration>,
}

impl LoopbackBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribes(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::SeqCst)
    }

    /// Make every later subscribe fail
    pub fn refuse_subscriptions(&self) {
        self.fail_subscribe.store(true, Ordering::SeqCst);
    }

    /// Hold every later SUBACK back for `delay`; the filter is live meanwhile
    pub fn delay_subacks(&self, delay: Duration) {
        *self.suback_delay.lock() = delay;
    }

    /// Active filters across all links
    pub fn filter_count(&self) -> usize {
        self.links.lock().iter().map(|l| l.filters.len()).sum()
    }

    /// Simulate a dropped and re-established session on every link
    pub fn bounce(&self) {
        for link in self.links.lock().iter_mut() {
            link.filters.clear();
            let _ = link.events.try_send(LinkEvent::Disconnected("bounce".into()));
            let _ = link.events.try_send(LinkEvent::Connected);
        }
    }

    /// Inject a message as if another client published it
    pub async fn inject(&self, topic_name: &str, payload: &[u8], qos: QoS) {
        let targets: Vec<mpsc::Sender<LinkEvent>> = self
            .links
            .lock()
            .iter()
            .filter(|l| l.filters.iter().any(|f| topic::matches(f, topic_name)))
            .map(|l| l.events.clone())
            .collect();
        for target in targets {
            let message = InboundMessage::new(topic_name, payload.to_vec(), qos, false);
            let _ = target.send(LinkEvent::Message(message)).await;
        }
    }
}

struct LoopbackLink {
    broker: Arc<LoopbackBroker>,
    slot: usize,
}

#[async_trait]
impl MqttLink for LoopbackLink {
    async fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), RelayError> {
        if self.broker.fail_subscribe.load(Ordering::SeqCst) {
            return Err(RelayError::Rejected(format!("not authorized: {}", filter)));
        }
        self.broker.subscribes.fetch_add(1, Ordering::SeqCst);
        self.broker.links.lock()[self.slot]
            .filters
            .insert(filter.to_string());
        let delay = *self.broker.suback_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), RelayError> {
        self.broker.unsubscribes.fetch_add(1, Ordering::SeqCst);
        self.broker.links.lock()[self.slot].filters.remove(filter);
        Ok(())
    }

    async fn publish(
        &self,
        topic_name: &str,
        payload: Vec<u8>,
        qos: QoS,
        _retain: bool,
    ) -> Result<(), RelayError> {
        self.broker.publishes.fetch_add(1, Ordering::SeqCst);
        self.broker.inject(topic_name, &payload, qos).await;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), RelayError> {
        Ok(())
    }
}

/// Opens links on a shared [`LoopbackBroker`]
pub struct LoopbackConnector(pub Arc<LoopbackBroker>);

#[async_trait]
impl MqttConnector for LoopbackConnector {
    async fn connect(
        &self,
        slot: usize,
    ) -> Result<(Arc<dyn MqttLink>, mpsc::Receiver<LinkEvent>), RelayError> {
        let (tx, rx) = mpsc::channel(1024);
        let _ = tx.try_send(LinkEvent::Connected);
        let mut links = self.0.links.lock();
        let index = links.len();
        assert_eq!(index, slot, "links are opened in slot order");
        links.push(LinkState {
            events: tx,
            filters: HashSet::new(),
        });
        Ok((
            Arc::new(LoopbackLink {
                broker: self.0.clone(),
                slot: index,
            }),
            rx,
        ))
    }
}

/// Test configuration with fast retries
pub fn config() -> BridgeConfig {
    BridgeConfig::builder()
        .api_url("http://emqx.test:18083/api/v5")
        .credentials("key", "secret")
        .retries(3, Duration::from_millis(1), Duration::from_millis(5))
        .build()
}

/// Same as [`config`] but logging in for a bearer token
pub fn bearer_config() -> BridgeConfig {
    BridgeConfig::builder()
        .api_url("http://emqx.test:18083/api/v5")
        .credentials("admin", "public")
        .auth_mode(AuthMode::Bearer)
        .retries(3, Duration::from_millis(1), Duration::from_millis(5))
        .build()
}

/// Fully wired bridge over test doubles
pub struct Bridge {
    pub api: Arc<FakeApi>,
    pub mqtt: Arc<LoopbackBroker>,
    pub broker: Arc<BrokerClient>,
    pub relay: Arc<MqttRelay>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: ToolDispatcher,
    pub server: Arc<McpServer>,
}

impl Bridge {
    pub async fn new(api: Arc<FakeApi>) -> Self {
        Self::with(config(), api, 256).await
    }

    pub async fn with(config: BridgeConfig, api: Arc<FakeApi>, queue_capacity: usize) -> Self {
        let mqtt = LoopbackBroker::new();
        let broker = Arc::new(BrokerClient::with_transport(&config, api.clone()).unwrap());
        let relay = Arc::new(
            MqttRelay::connect(Arc::new(LoopbackConnector(mqtt.clone())), 2, queue_capacity)
                .await
                .unwrap(),
        );
        let sessions = Arc::new(SessionManager::new(relay.clone()));
        let dispatcher = ToolDispatcher::new(broker.clone(), relay.clone(), sessions.clone());
        let server = Arc::new(McpServer::new(ToolDispatcher::new(
            broker.clone(),
            relay.clone(),
            sessions.clone(),
        )));
        Self {
            api,
            mqtt,
            broker,
            relay,
            sessions,
            dispatcher,
            server,
        }
    }

    /// Connect an in-memory MCP client
    pub fn client(&self) -> TestClient {
        let (client, server_side) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(server_side);
        let server = self.server.clone();
        let task = tokio::spawn(async move {
            server
                .serve(BufReader::new(read), write)
                .await
                .map_err(|e| e.to_string())
        });
        let (client_read, client_write) = tokio::io::split(client);
        TestClient {
            writer: client_write,
            lines: BufReader::new(client_read).lines(),
            pending: Vec::new(),
            next_id: 1,
            task,
        }
    }
}

/// MCP client speaking line-delimited JSON-RPC to the server under test
pub struct TestClient {
    writer: WriteHalf<DuplexStream>,
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    pending: Vec<Value>,
    next_id: u64,
    task: JoinHandle<Result<(), String>>,
}

const READ_TIMEOUT: Duration = Duration::from_secs(5);

impl TestClient {
    pub async fn send(&mut self, message: Value) {
        let mut line = message.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Write raw bytes followed by a newline
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn read(&mut self) -> Value {
        let line = tokio::time::timeout(READ_TIMEOUT, self.lines.next_line())
            .await
            .expect("timed out waiting for server output")
            .unwrap()
            .expect("server closed the stream");
        serde_json::from_str(&line).unwrap()
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, method: &str, params: Value) -> Value {
        let id = self.next_id;
        self.next_id += 1;
        self.send(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        loop {
            let message = self.read().await;
            if message.get("id") == Some(&json!(id)) {
                return message;
            }
            self.pending.push(message);
        }
    }

    /// Call a tool and wait for its response
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Value {
        self.request("tools/call", json!({"name": name, "arguments": arguments}))
            .await
    }

    /// Messages read while waiting for other responses
    pub fn buffered(&self) -> &[Value] {
        &self.pending
    }

    /// Next server-initiated notification
    pub async fn notification(&mut self) -> Value {
        if !self.pending.is_empty() {
            return self.pending.remove(0);
        }
        loop {
            let message = self.read().await;
            if message.get("id").is_none() {
                return message;
            }
        }
    }

    /// Close the connection and wait for the server to finish with it
    pub async fn close(self) {
        let TestClient { writer, lines, task, .. } = self;
        drop(writer);
        drop(lines);
        tokio::time::timeout(READ_TIMEOUT, task)
            .await
            .expect("server did not finish the session")
            .unwrap()
            .unwrap();
    }
}

/// Parse the JSON document inside a successful tool response
pub fn tool_json(response: &Value) -> Value {
    let text = response["result"]["content"][0]["text"]
        .as_str()
        .unwrap_or_else(|| panic!("not a tool result: {}", response));
    serde_json::from_str(text).unwrap()
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
