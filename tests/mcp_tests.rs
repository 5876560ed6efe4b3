//! MCP server integration tests
//!
//! These tests verify the MCP protocol surface: framing, lifecycle methods,
//! the tool catalogue, and error shapes.

mod common;

use common::{Bridge, FakeApi};
use emqx_mcp_bridge::mcp::dispatch;
use emqx_mcp_bridge::mcp::types::{JsonRpcRequest, JsonRpcResponse, McpToolDefinition, ToolCallResult};
use emqx_mcp_bridge::mcp::{McpServer, AVAILABLE_TOOLS};
use serde_json::json;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

#[test]
fn test_jsonrpc_request_parsing() {
    let json = r#"{
        "jsonrpc": "2.0",
        "method": "tools/list",
        "id": 1
    }"#;

    let request: JsonRpcRequest = serde_json::from_str(json).unwrap();
    assert_eq!(request.method, "tools/list");
    assert_eq!(request.id, Some(json!(1)));
}

#[test]
fn test_jsonrpc_response_error() {
    let response = JsonRpcResponse::error(Some(json!(1)), -32600, "Invalid Request");
    let json = serde_json::to_string(&response).unwrap();

    assert!(json.contains("\"error\""));
    assert!(json.contains("-32600"));
    assert!(!json.contains("\"result\""));
}

#[test]
fn test_tool_definitions_have_schemas() {
    for descriptor in dispatch::descriptors() {
        let def = descriptor.definition();

        assert!(!def.name.is_empty(), "Tool name should not be empty");
        assert!(
            !def.description.is_empty(),
            "Tool {} should have a description",
            def.name
        );
        assert_eq!(
            def.input_schema["type"], "object",
            "Tool {} schema should be type object",
            def.name
        );
        assert!(
            def.input_schema["properties"].is_object(),
            "Tool {} should have properties",
            def.name
        );

        // Every required field is a declared property
        for required in def.input_schema["required"].as_array().unwrap() {
            let name = required.as_str().unwrap();
            assert!(
                def.input_schema["properties"][name].is_object(),
                "Tool {} requires undeclared {}",
                def.name,
                name
            );
        }
    }
}

#[test]
fn test_available_tools_constant() {
    assert_eq!(AVAILABLE_TOOLS.len(), 10);
    assert!(AVAILABLE_TOOLS.contains(&"publish_mqtt_message"));
    assert!(AVAILABLE_TOOLS.contains(&"list_mqtt_clients"));
    assert!(AVAILABLE_TOOLS.contains(&"get_mqtt_client"));
    assert!(AVAILABLE_TOOLS.contains(&"kick_mqtt_client"));
    assert!(AVAILABLE_TOOLS.contains(&"subscribe_mqtt_topic"));
}

#[test]
fn test_tool_call_result_text() {
    let result = ToolCallResult::text("Hello, world!");
    assert!(!result.is_error);
    assert_eq!(result.content.len(), 1);

    let json = serde_json::to_string(&result).unwrap();
    assert!(json.contains("Hello, world!"));
    assert!(!json.contains("isError"));
}

#[test]
fn test_mcp_tool_definition_serialization() {
    let def = dispatch::descriptor("get_mqtt_client").unwrap().definition();

    let json = serde_json::to_string(&def).unwrap();
    assert!(json.contains("\"name\":\"get_mqtt_client\""));
    assert!(json.contains("\"inputSchema\""));

    let parsed: McpToolDefinition = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.name, "get_mqtt_client");
    assert_eq!(parsed.input_schema["required"], json!(["clientid"]));
}

#[tokio::test]
async fn test_mcp_initialize_handshake() {
    let bridge = Bridge::new(FakeApi::ok()).await;
    let mut client = bridge.client();

    let response = client
        .request(
            "initialize",
            json!({"protocolVersion": "2024-11-05", "capabilities": {}}),
        )
        .await;
    let result = &response["result"];
    assert_eq!(result["protocolVersion"], "2024-11-05");
    assert_eq!(result["serverInfo"]["name"], "emqx-mcp-bridge");
    assert_eq!(result["capabilities"]["resources"]["subscribe"], true);

    client
        .send(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .await;
    let pong = client.request("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    client.close().await;
}

#[tokio::test]
async fn test_mcp_tools_list_response() {
    let bridge = Bridge::new(FakeApi::ok()).await;
    let mut client = bridge.client();

    let response = client.request("tools/list", json!({})).await;
    let tools = response["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), AVAILABLE_TOOLS.len());

    for tool in tools {
        assert!(tool["name"].is_string());
        assert!(tool["description"].is_string());
        assert!(tool["inputSchema"].is_object());
    }

    client.close().await;
}

#[tokio::test]
async fn test_parse_error_keeps_session_alive() {
    let bridge = Bridge::new(FakeApi::ok()).await;
    let mut client = bridge.client();

    client.send(json!("not a request")).await;
    let pong = client.request("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    let parse_error = client
        .buffered()
        .iter()
        .find(|m| m["error"]["code"] == -32700 || m["error"]["code"] == -32600);
    assert!(parse_error.is_some());

    client.close().await;
}

#[tokio::test]
async fn test_invalid_utf8_keeps_session_alive() {
    let bridge = Bridge::new(FakeApi::ok()).await;
    let mut client = bridge.client();

    client
        .send_raw(b"{\"jsonrpc\":\"2.0\",\"id\":99,\"method\":\"caf\xe9\"}")
        .await;
    client.send_raw(&[0xc3, 0x28, 0xa0, 0xa1]).await;
    let pong = client.request("ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));

    let parse_errors = client
        .buffered()
        .iter()
        .filter(|m| m["error"]["code"] == -32700)
        .count();
    assert_eq!(parse_errors, 2);
    assert_eq!(bridge.sessions.session_count(), 1);

    client.close().await;
}

#[tokio::test]
async fn test_unknown_method() {
    let bridge = Bridge::new(FakeApi::ok()).await;
    let mut client = bridge.client();

    let response = client.request("prompts/list", json!({})).await;
    assert_eq!(response["error"]["code"], -32601);

    client.close().await;
}

#[tokio::test]
async fn test_tcp_transport_serves_sessions() {
    let bridge = Bridge::new(FakeApi::ok()).await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server: Arc<McpServer> = bridge.server.clone();
    let accept = tokio::spawn(server.accept_loop(listener));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    write
        .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["id"], 1);
    assert_eq!(response["result"], json!({}));
    assert_eq!(bridge.sessions.session_count(), 1);

    drop(write);
    drop(lines);
    assert!(common::eventually(|| bridge.sessions.session_count() == 0).await);

    accept.abort();
}
