//! Stratum v1 message types and JSON-RPC serialization.
//!
//! Stratum predates JSON-RPC 2.0 and keeps its own conventions: server
//! notifications carry `id: null`, errors are `[code, message, null]`
//! arrays, and there is no version field. A small custom envelope fits
//! those quirks better than a general JSON-RPC library would.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Stratum error codes, following the ckpool conventions miners expect.
pub mod code {
    /// Catch-all: malformed params, bad ntime, internal trouble
    pub const OTHER: i32 = 20;
    /// Share names a job outside the retention window
    pub const JOB_NOT_FOUND: i32 = 21;
    /// Share fingerprint already seen this session
    pub const DUPLICATE: i32 = 22;
    /// Share hash above the session target
    pub const LOW_DIFFICULTY: i32 = 23;
    /// Submit before a successful authorize
    pub const UNAUTHORIZED: i32 = 24;
    /// Method the server does not implement
    pub const UNKNOWN_METHOD: i32 = -3;
    /// Connection cap reached
    pub const TOO_MANY_CONNECTIONS: i32 = 503;
}

/// JSON-RPC message envelope.
///
/// Requests from miners carry an id; notifications (either direction) use
/// `id: null`; responses echo the request id with `result` and `error`
/// always present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request {
        /// Message id (null for notifications)
        id: Option<u64>,
        /// Method name (e.g. "mining.subscribe")
        method: String,
        /// Method parameters
        #[serde(default)]
        params: Value,
    },

    /// Response to a request
    Response {
        /// Message id matching the request
        id: u64,
        /// Result value (null on failure)
        #[serde(default)]
        result: Value,
        /// Error triple `[code, message, null]` (null on success)
        #[serde(default)]
        error: Value,
    },
}

impl JsonRpcMessage {
    /// Successful response.
    pub fn ok(id: u64, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result,
            error: Value::Null,
        }
    }

    /// Error response in the `[code, message, null]` shape.
    pub fn err(id: u64, code: i32, message: &str) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Value::Null,
            error: json!([code, message, Value::Null]),
        }
    }

    /// Server-to-client notification.
    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        JsonRpcMessage::Request {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            JsonRpcMessage::Request { method, .. } => Some(method),
            JsonRpcMessage::Response { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subscribe_request() {
        let msg: JsonRpcMessage = serde_json::from_str(
            r#"{"id": 1, "method": "mining.subscribe", "params": ["bitaxe/2.4.1"]}"#,
        )
        .unwrap();

        match msg {
            JsonRpcMessage::Request { id, method, params } => {
                assert_eq!(id, Some(1));
                assert_eq!(method, "mining.subscribe");
                assert_eq!(params, json!(["bitaxe/2.4.1"]));
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn test_parse_request_without_params() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id": 7, "method": "mining.subscribe"}"#).unwrap();
        assert_eq!(msg.method(), Some("mining.subscribe"));
    }

    #[test]
    fn test_notification_serializes_null_id() {
        let msg = JsonRpcMessage::notification("mining.set_difficulty", json!([512.0]));
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("\"id\":null"));
        assert!(text.contains("mining.set_difficulty"));
    }

    #[test]
    fn test_ok_response_has_explicit_null_error() {
        let text = serde_json::to_string(&JsonRpcMessage::ok(3, json!(true))).unwrap();
        assert!(text.contains("\"result\":true"));
        assert!(text.contains("\"error\":null"));
    }

    #[test]
    fn test_err_response_shape() {
        let msg = JsonRpcMessage::err(9, code::JOB_NOT_FOUND, "Job not found");
        let text = serde_json::to_string(&msg).unwrap();
        assert!(text.contains("[21,\"Job not found\",null]"));
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(serde_json::from_str::<JsonRpcMessage>("{nope").is_err());
        assert!(serde_json::from_str::<JsonRpcMessage>(r#"[1, 2]"#).is_err());
    }

    #[test]
    fn test_client_ack_parses_as_response() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"id": 4, "result": true, "error": null}"#).unwrap();
        assert!(matches!(msg, JsonRpcMessage::Response { id: 4, .. }));
    }
}
