//! JSON-RPC message shapes for the backend session.
//!
//! The backend speaks JSON-RPC 2.0 over the same Content-Length framing as
//! the editor transport. Only the shapes the bridge sends and routes are
//! modeled; feature results stay opaque [`serde_json::Value`]s end to end.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A JSON-RPC request (expects a response).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn new(id: i64, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// A JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// A JSON-RPC notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: Some(params),
        }
    }
}

/// A JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Classify an inbound payload without fully deserializing it.
///
/// A payload with an `id` and no `method` is a response; one with a `method`
/// and no `id` is a notification. Anything else (server-to-client requests
/// included) is surfaced as `Other` for the caller to log and skip.
#[derive(Debug)]
pub enum Inbound {
    Response(RpcResponse),
    Notification(RpcNotification),
    Other(Value),
}

impl Inbound {
    pub fn classify(payload: Value) -> Inbound {
        let has_id = payload.get("id").map_or(false, |id| !id.is_null());
        let has_method = payload.get("method").is_some();

        match (has_id, has_method) {
            (true, false) => match serde_json::from_value(payload.clone()) {
                Ok(response) => Inbound::Response(response),
                Err(_) => Inbound::Other(payload),
            },
            (false, true) => match serde_json::from_value(payload.clone()) {
                Ok(notification) => Inbound::Notification(notification),
                Err(_) => Inbound::Other(payload),
            },
            _ => Inbound::Other(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serializes_with_version() {
        let request = RpcRequest::new(7, "initialize", json!({"rootUri": null}));
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["id"], 7);
        assert_eq!(value["method"], "initialize");
    }

    #[test]
    fn test_notification_omits_absent_params() {
        let notification = RpcNotification {
            jsonrpc: "2.0".to_string(),
            method: "initialized".to_string(),
            params: None,
        };
        let text = serde_json::to_string(&notification).unwrap();
        assert!(!text.contains("params"));
    }

    #[test]
    fn test_classify_response() {
        let inbound = Inbound::classify(json!({"jsonrpc": "2.0", "id": 3, "result": {}}));
        assert!(matches!(inbound, Inbound::Response(r) if r.id == 3));
    }

    #[test]
    fn test_classify_notification() {
        let inbound = Inbound::classify(json!({
            "jsonrpc": "2.0",
            "method": "window/logMessage",
            "params": {"type": 3, "message": "hi"}
        }));
        assert!(matches!(inbound, Inbound::Notification(n) if n.method == "window/logMessage"));
    }

    #[test]
    fn test_classify_server_request_as_other() {
        // Server-to-client request: has both id and method.
        let inbound = Inbound::classify(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "workspace/configuration",
            "params": {}
        }));
        assert!(matches!(inbound, Inbound::Other(_)));
    }

    #[test]
    fn test_classify_error_response() {
        let inbound = Inbound::classify(json!({
            "jsonrpc": "2.0",
            "id": 9,
            "error": {"code": -32601, "message": "not found"}
        }));
        match inbound {
            Inbound::Response(response) => {
                assert!(response.result.is_none());
                assert_eq!(response.error.unwrap().code, -32601);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }
}
