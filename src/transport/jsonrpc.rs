//! JSON-RPC 2.0 envelope types for the tool protocol.
//!
//! The gateway never interprets tool payloads beyond these envelopes: params,
//! results, error data, and IDs are all carried as `serde_json::Value` and
//! relayed verbatim. Deserialization dispatches on which keys are present
//! because `#[serde(untagged)]` cannot reliably tell a request from a
//! response.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameter(s).
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Deserializes a present JSON value (including `null`) as `Some(value)`.
///
/// JSON-RPC 2.0 distinguishes `"result": null` (valid success) from an
/// absent `result` key, so `null` must become `Some(Value::Null)` while a
/// missing key falls back to `#[serde(default)]` → `None`.
fn deserialize_some<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Any JSON-RPC 2.0 message crossing an adapter: a request (method + id),
/// a notification (method, no id), or a response (result/error + id).
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::derive_partial_eq_without_eq)] // serde_json::Value is not Eq
pub enum JsonRpcMessage {
    /// A request expecting a correlated reply.
    Request(JsonRpcRequest),
    /// A reply to a previous request.
    Response(JsonRpcResponse),
    /// A fire-and-forget notification.
    Notification(JsonRpcNotification),
}

impl JsonRpcMessage {
    /// Returns the message ID, if the variant carries one.
    #[must_use]
    pub const fn id(&self) -> Option<&Value> {
        match self {
            Self::Request(r) => Some(&r.id),
            Self::Response(r) => Some(&r.id),
            Self::Notification(_) => None,
        }
    }

    /// Returns the method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

impl Serialize for JsonRpcMessage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(r) => r.serialize(serializer),
            Self::Response(r) => r.serialize(serializer),
            Self::Notification(n) => n.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcMessage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let obj = value
            .as_object()
            .ok_or_else(|| serde::de::Error::custom("JSON-RPC message must be an object"))?;

        let has_method = obj.contains_key("method");
        let has_id = obj.contains_key("id");
        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");

        if has_result || has_error {
            let response: JsonRpcResponse = serde_json::from_value(value)
                .map_err(|e| serde::de::Error::custom(format!("invalid response: {e}")))?;
            Ok(Self::Response(response))
        } else if has_method && has_id {
            let request: JsonRpcRequest = serde_json::from_value(value)
                .map_err(|e| serde::de::Error::custom(format!("invalid request: {e}")))?;
            Ok(Self::Request(request))
        } else if has_method {
            let notification: JsonRpcNotification = serde_json::from_value(value)
                .map_err(|e| serde::de::Error::custom(format!("invalid notification: {e}")))?;
            Ok(Self::Notification(notification))
        } else {
            Err(serde::de::Error::custom(
                "JSON-RPC message must have 'method' or 'result'/'error'",
            ))
        }
    }
}

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0").
    pub jsonrpc: String,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters, relayed verbatim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request identifier; string or number, preserved round-trip.
    pub id: Value,
}

impl JsonRpcRequest {
    /// Creates a request with the given method, params, and id.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id,
        }
    }

    /// Canonical string form of the id, used as the correlation key in
    /// pending-reply maps. `1` and `"1"` intentionally produce distinct keys.
    #[must_use]
    pub fn id_key(&self) -> String {
        id_key(&self.id)
    }
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0").
    pub jsonrpc: String,
    /// Result value; `Some(Value::Null)` when the wire carried `"result": null`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_some"
    )]
    pub result: Option<Value>,
    /// Error object (present on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Identifier of the request this answers.
    pub id: Value,
}

impl JsonRpcResponse {
    /// Creates a successful response.
    #[must_use]
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Creates an error response.
    #[must_use]
    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
            id,
        }
    }

    /// Correlation key of this response's id.
    #[must_use]
    pub fn id_key(&self) -> String {
        id_key(&self.id)
    }

    /// Whether this reply answers the request with the given id.
    #[must_use]
    pub fn answers(&self, request_id: &Value) -> bool {
        &self.id == request_id
    }
}

/// A JSON-RPC 2.0 notification (no `id`, no reply expected).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub struct JsonRpcNotification {
    /// Protocol version (must be "2.0").
    pub jsonrpc: String,
    /// Method name.
    pub method: String,
    /// Parameters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Creates a new notification.
    #[must_use]
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Canonical correlation key for a JSON-RPC id value.
///
/// Numbers and strings map to distinct keys (`#1` vs `"1"`) so a peer cannot
/// alias two outstanding requests.
#[must_use]
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => format!("\"{s}\""),
        other => format!("#{other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trip_preserves_id() {
        for id in [json!(7), json!("req-42"), json!(-3)] {
            let request = JsonRpcRequest::new("tools/call", Some(json!({"name": "echo"})), id.clone());
            let wire = serde_json::to_string(&request).unwrap();
            let back: JsonRpcMessage = serde_json::from_str(&wire).unwrap();
            assert_eq!(back.id(), Some(&id));
        }
    }

    #[test]
    fn dispatch_by_key_presence() {
        let req: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tools/list","id":1}"#).unwrap();
        assert!(matches!(req, JsonRpcMessage::Request(_)));

        let notif: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#).unwrap();
        assert!(matches!(notif, JsonRpcMessage::Notification(_)));

        let resp: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":42,"id":1}"#).unwrap();
        assert!(matches!(resp, JsonRpcMessage::Response(_)));

        let err: JsonRpcMessage = serde_json::from_str(
            r#"{"jsonrpc":"2.0","error":{"code":-32601,"message":"nope"},"id":1}"#,
        )
        .unwrap();
        assert!(matches!(err, JsonRpcMessage::Response(_)));
    }

    #[test]
    fn null_result_survives_round_trip() {
        let msg: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","result":null,"id":1}"#).unwrap();
        let JsonRpcMessage::Response(resp) = &msg else {
            panic!("expected response");
        };
        assert_eq!(resp.result, Some(Value::Null));
        let wire = serde_json::to_string(&msg).unwrap();
        assert!(wire.contains(r#""result":null"#));
    }

    #[test]
    fn missing_jsonrpc_field_rejected() {
        assert!(serde_json::from_str::<JsonRpcMessage>(r#"{"method":"x","id":1}"#).is_err());
        assert!(serde_json::from_str::<JsonRpcMessage>(r#"{"result":1,"id":1}"#).is_err());
    }

    #[test]
    fn garbage_rejected() {
        assert!(serde_json::from_str::<JsonRpcMessage>("").is_err());
        assert!(serde_json::from_str::<JsonRpcMessage>("[1,2]").is_err());
        assert!(serde_json::from_str::<JsonRpcMessage>("{}").is_err());
        assert!(
            serde_json::from_str::<JsonRpcMessage>(r#"{"jsonrpc":"2.0","id":1,"params":{}}"#)
                .is_err()
        );
    }

    #[test]
    fn id_keys_distinguish_types() {
        assert_ne!(id_key(&json!(1)), id_key(&json!("1")));
        assert_eq!(id_key(&json!("a")), id_key(&json!("a")));
        assert_eq!(id_key(&json!(5)), "#5");
    }

    #[test]
    fn answers_matches_exact_id() {
        let resp = JsonRpcResponse::success(json!("abc"), json!({}));
        assert!(resp.answers(&json!("abc")));
        assert!(!resp.answers(&json!("abd")));
        assert!(!resp.answers(&json!(1)));
    }

    #[test]
    fn notification_omits_absent_params() {
        let wire = serde_json::to_string(&JsonRpcNotification::new("ping", None)).unwrap();
        let parsed: Value = serde_json::from_str(&wire).unwrap();
        assert!(parsed.get("params").is_none());
        assert!(parsed.get("id").is_none());
    }

    #[test]
    fn error_response_shape() {
        let resp = JsonRpcResponse::error(json!(2), error_codes::METHOD_NOT_FOUND, "unknown");
        let wire = serde_json::to_value(&resp).unwrap();
        assert!(wire.get("result").is_none());
        assert_eq!(wire["error"]["code"], json!(-32601));
    }
}
