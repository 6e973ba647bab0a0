//! Integration tests for JSON-RPC protocol handling.
//!
//! These tests verify the gateway's JSON-RPC 2.0 envelope handling:
//! request/notification classification, error replies, and the namespaced
//! tool descriptor shapes served to the client.

use switchboard_mcp::catalog::namespace_tools;
use switchboard_mcp::config::derive_namespace;
use switchboard_mcp::mcp::protocol::{
    parse_message, EnvelopeError, IncomingMessage, JsonRpcError, RequestId, ToolDescriptor,
};

// =============================================================================
// Protocol Parsing Tests
// =============================================================================

#[test]
fn test_parse_initialize_request() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {
                "name": "test-client",
                "version": "1.0.0"
            }
        }
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let IncomingMessage::Request(req) = result.unwrap() {
        assert_eq!(req.method, "initialize");
        assert_eq!(req.id, RequestId::Number(1));
        assert!(req.params.is_some());
    } else {
        panic!("Expected Request");
    }
}

#[test]
fn test_parse_tools_call_request_with_string_id() {
    let json = r#"{
        "jsonrpc": "2.0",
        "id": "req-77",
        "method": "tools/call",
        "params": {
            "name": "foo_bar_ping",
            "parameters": {}
        }
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let IncomingMessage::Request(req) = result.unwrap() {
        assert_eq!(req.method, "tools/call");
        assert_eq!(req.id, RequestId::String("req-77".to_string()));
    } else {
        panic!("Expected Request");
    }
}

#[test]
fn test_parse_notification() {
    let json = r#"{
        "jsonrpc": "2.0",
        "method": "notifications/initialized"
    }"#;

    let result = parse_message(json);
    assert!(result.is_ok());

    if let IncomingMessage::Notification(notif) = result.unwrap() {
        assert_eq!(notif.method, "notifications/initialized");
    } else {
        panic!("Expected Notification");
    }
}

#[test]
fn test_parse_invalid_json() {
    let result = parse_message("not valid json");

    match result.unwrap_err() {
        EnvelopeError::Reply(reply) => {
            assert_eq!(reply.error.code, -32700); // Parse error
            assert!(reply.id.is_none());
        }
        EnvelopeError::Drop(_) => panic!("Expected an error reply"),
    }
}

#[test]
fn test_parse_missing_jsonrpc_version_with_id() {
    let json = r#"{
        "id": 1,
        "method": "test"
    }"#;

    match parse_message(json).unwrap_err() {
        EnvelopeError::Reply(reply) => {
            assert_eq!(reply.error.code, -32600); // Invalid request
            assert_eq!(reply.id, Some(RequestId::Number(1)));
        }
        EnvelopeError::Drop(_) => panic!("Expected an error reply"),
    }
}

#[test]
fn test_parse_missing_jsonrpc_version_without_id_is_dropped() {
    let json = r#"{ "method": "test" }"#;
    assert!(matches!(
        parse_message(json).unwrap_err(),
        EnvelopeError::Drop(_)
    ));
}

#[test]
fn test_wrong_jsonrpc_version_rejected() {
    let json = r#"{ "jsonrpc": "1.0", "id": 4, "method": "ping" }"#;
    match parse_message(json).unwrap_err() {
        EnvelopeError::Reply(reply) => assert_eq!(reply.error.code, -32600),
        EnvelopeError::Drop(_) => panic!("Expected an error reply"),
    }
}

// =============================================================================
// Error Reply Shape Tests
// =============================================================================

#[test]
fn test_error_replies_serialise_with_code_and_message() {
    let error = JsonRpcError::method_not_found(RequestId::Number(3), "nope_x");
    let value = serde_json::to_value(&error).unwrap();

    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["id"], 3);
    assert_eq!(value["error"]["code"], -32601);
    assert!(value["error"]["message"]
        .as_str()
        .unwrap()
        .contains("nope_x"));
}

#[test]
fn test_parse_error_reply_has_null_id() {
    let value = serde_json::to_value(JsonRpcError::parse_error()).unwrap();
    assert!(value["id"].is_null());
    assert_eq!(value["error"]["code"], -32700);
}

// =============================================================================
// Namespacing Tests
// =============================================================================

#[test]
fn test_namespace_derivation_is_deterministic() {
    assert_eq!(derive_namespace("Foo Bar"), "foo_bar");
    assert_eq!(derive_namespace("Foo   Bar"), "foo_bar");
    assert_eq!(derive_namespace("FOO\tBAR"), "foo_bar");
}

#[test]
fn test_namespaced_descriptor_shape() {
    let tools = vec![ToolDescriptor {
        name: "ping".to_string(),
        description: String::new(),
        parameters: serde_json::json!({}),
        extra: serde_json::Map::new(),
    }];

    let namespaced = namespace_tools("Foo Bar", &derive_namespace("Foo Bar"), tools);
    assert_eq!(namespaced[0].name, "foo_bar_ping");
    assert_eq!(namespaced[0].description, "[Foo Bar] ");
}

#[test]
fn test_namespacing_preserves_unknown_descriptor_fields() {
    let descriptor: ToolDescriptor = serde_json::from_str(
        r#"{ "name": "ping", "description": "d", "parameters": {}, "title": "Ping!" }"#,
    )
    .unwrap();

    let namespaced = namespace_tools("svc", "svc", vec![descriptor]);
    let value = serde_json::to_value(&namespaced[0]).unwrap();
    assert_eq!(value["title"], "Ping!");
    assert_eq!(value["name"], "svc_ping");
    assert_eq!(value["description"], "[svc] d");
}
