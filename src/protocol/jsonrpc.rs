//! JSON-RPC 2.0 envelope types.
//!
//! - Request: `{"jsonrpc": "2.0", "method": "...", "params": ..., "id": ...}`
//! - Response: `{"jsonrpc": "2.0", "result": ... | "error": {...}, "id": ...}`
//! - A request without `id` is a notification and gets no response.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error.
pub const INTERNAL_ERROR: i64 = -32603;

// Aggregator-specific codes, inside the implementation-defined server range.
pub const NO_HEALTHY_BACKEND: i64 = -32001;
pub const BACKEND_TIMEOUT: i64 = -32002;
pub const POOL_EXHAUSTED: i64 = -32003;
pub const REQUEST_CANCELLED: i64 = -32004;
pub const BACKEND_UNAVAILABLE: i64 = -32005;

/// Inbound or outbound JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Copy of this request carrying a different id.
    pub fn with_id(&self, id: impl Into<Value>) -> Self {
        Self {
            id: Some(id.into()),
            ..self.clone()
        }
    }
}

/// JSON-RPC response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Split into the payload or the error object.
    ///
    /// A response carrying neither is treated as a `null` result.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn parse_error() -> Self {
        Self::new(PARSE_ERROR, "Parse error")
    }

    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, detail)
    }
}

/// Parse one inbound message.
///
/// On failure the error is already shaped as the response to send back:
/// unparseable JSON answers with `id: null`, a malformed envelope keeps
/// whatever id could be recovered.
pub fn parse_message(raw: &[u8]) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value =
        serde_json::from_slice(raw).map_err(|_| JsonRpcResponse::failure(Value::Null, JsonRpcError::parse_error()))?;

    if value.is_array() {
        return Err(JsonRpcResponse::failure(
            Value::Null,
            JsonRpcError::invalid_request("batch requests are not supported"),
        ));
    }

    let id = value.get("id").cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| JsonRpcResponse::failure(id, JsonRpcError::invalid_request(format!("invalid request: {}", e))))
}

impl std::fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}
