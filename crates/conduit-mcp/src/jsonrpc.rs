//! JSON-RPC 2.0 types for MCP communication.

use crate::error::McpError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The only JSON-RPC version MCP speaks.
pub const JSONRPC_VERSION: &str = "2.0";

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a successful response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id: Some(id),
            result: None,
            error: Some(error),
        }
    }

    /// Convert into the `result` value, surfacing an `error` object as
    /// [`McpError::JsonRpc`]. A response with neither yields `null`.
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::JsonRpc {
                code: err.code,
                message: err.message,
                data: err.data,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Create a new JSON-RPC notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

/// An inbound message after classification.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// Reply to one of our requests.
    Response(JsonRpcResponse),
    /// Out-of-band message from the server. Server-originated requests land
    /// here too since this client never answers them.
    Notification(JsonRpcNotification),
    /// Valid JSON that is neither of the above.
    Unrecognized(Value),
}

/// Classify one raw JSON-RPC message.
///
/// A non-empty `method` makes it a notification. Otherwise a non-zero `id`,
/// or the presence of `result`/`error`, makes it a response. Id `0` is never
/// issued by this client, so a zero id alone does not count.
pub fn classify(raw: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(raw)?;
    let Some(obj) = value.as_object() else {
        return Ok(Inbound::Unrecognized(value));
    };

    let has_method = obj
        .get("method")
        .and_then(Value::as_str)
        .is_some_and(|m| !m.is_empty());
    if has_method {
        return serde_json::from_value(value).map(Inbound::Notification);
    }

    let has_id = obj
        .get("id")
        .and_then(Value::as_u64)
        .is_some_and(|id| id != 0);
    if has_id || obj.contains_key("result") || obj.contains_key("error") {
        return serde_json::from_value(value).map(Inbound::Response);
    }

    Ok(Inbound::Unrecognized(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_request_with_params() {
        let req = JsonRpcRequest::new(
            1,
            "tools/call",
            Some(serde_json::json!({"name": "read", "arguments": {}})),
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "tools/call");
        assert!(json["params"].is_object());
    }

    #[test]
    fn serialize_request_without_params() {
        let req = JsonRpcRequest::new(2, "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["id"], 2);
        assert!(json.get("params").is_none());
    }

    #[test]
    fn serialized_request_is_single_line() {
        let req = JsonRpcRequest::new(3, "ping", Some(serde_json::json!({"a": [1, 2]})));
        let line = serde_json::to_string(&req).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains("\"id\":3"));
    }

    #[test]
    fn deserialize_response_with_error_data() {
        let json = r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid","data":"extra info"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32600);
        assert_eq!(err.data.unwrap(), "extra info");
    }

    #[test]
    fn into_result_surfaces_error_object() {
        let json =
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"Method not found"}}"#;
        let resp: JsonRpcResponse = serde_json::from_str(json).unwrap();
        match resp.into_result() {
            Err(McpError::JsonRpc { code, message, .. }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("Expected JsonRpc error, got {other:?}"),
        }
    }

    #[test]
    fn into_result_returns_result_value() {
        let resp = JsonRpcResponse::success(4, serde_json::json!({"ok": true}));
        assert_eq!(resp.into_result().unwrap()["ok"], true);
    }

    #[test]
    fn serialize_notification_has_no_id() {
        let notif =
            JsonRpcNotification::new("notifications/initialized", Some(serde_json::json!({})));
        let json = serde_json::to_value(&notif).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["method"], "notifications/initialized");
        assert!(json.get("id").is_none());
    }

    #[test]
    fn classify_response() {
        let inbound = classify(r#"{"jsonrpc":"2.0","id":7,"result":{}}"#).unwrap();
        match inbound {
            Inbound::Response(resp) => assert_eq!(resp.id, Some(7)),
            other => panic!("Expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let inbound =
            classify(r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#).unwrap();
        match inbound {
            Inbound::Notification(n) => assert_eq!(n.method, "notifications/tools/list_changed"),
            other => panic!("Expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classify_server_request_as_notification() {
        let inbound = classify(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(matches!(inbound, Inbound::Notification(_)));
    }

    #[test]
    fn classify_zero_id_without_payload_is_unrecognized() {
        let inbound = classify(r#"{"jsonrpc":"2.0","id":0}"#).unwrap();
        assert!(matches!(inbound, Inbound::Unrecognized(_)));
    }

    #[test]
    fn classify_zero_id_with_error_is_response() {
        let inbound =
            classify(r#"{"jsonrpc":"2.0","id":0,"error":{"code":-32700,"message":"Parse error"}}"#)
                .unwrap();
        assert!(matches!(inbound, Inbound::Response(_)));
    }

    #[test]
    fn classify_rejects_garbage() {
        assert!(classify("not json at all").is_err());
    }
}
