//! Canonical request form.
//!
//! Normalization rule: the method name is trimmed, absent and `null` params
//! are the same, object keys are sorted recursively, and array order is kept.
//! Two requests that differ only in object key order therefore share every
//! derived key.

use serde_json::Value;

use crate::protocol::jsonrpc::JsonRpcRequest;

/// A request reduced to the parts that determine its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    method: String,
    canonical_params: String,
}

impl NormalizedRequest {
    pub fn new(request: &JsonRpcRequest) -> Self {
        let mut canonical_params = String::new();
        match &request.params {
            None | Some(Value::Null) => canonical_params.push_str("null"),
            Some(params) => write_canonical(params, &mut canonical_params),
        }
        Self {
            method: request.method.trim().to_string(),
            canonical_params,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Canonical JSON text of the params.
    pub fn canonical_params(&self) -> &str {
        &self.canonical_params
    }

    /// Key fed to the hash ring: method and params, no backend identity.
    pub fn routing_key(&self) -> String {
        format!("{}\n{}", self.method, self.canonical_params)
    }
}

/// Write `value` as JSON with object keys in sorted order.
pub fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn req(method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest::new(1, method, params)
    }

    #[test]
    fn test_key_order_does_not_matter() {
        let a = NormalizedRequest::new(&req(
            "tools/call",
            Some(json!({"name": "search", "arguments": {"q": "rust", "limit": 5}})),
        ));
        let b = NormalizedRequest::new(&req(
            "tools/call",
            Some(json!({"arguments": {"limit": 5, "q": "rust"}, "name": "search"})),
        ));
        assert_eq!(a, b);
        assert_eq!(a.routing_key(), b.routing_key());
    }

    #[test]
    fn test_array_order_matters() {
        let a = NormalizedRequest::new(&req("m", Some(json!([1, 2]))));
        let b = NormalizedRequest::new(&req("m", Some(json!([2, 1]))));
        assert_ne!(a, b);
    }

    #[test]
    fn test_null_and_absent_params_match() {
        let a = NormalizedRequest::new(&req("tools/list", None));
        let b = NormalizedRequest::new(&req("tools/list", Some(Value::Null)));
        assert_eq!(a, b);
    }

    #[test]
    fn test_id_is_not_part_of_the_form() {
        let a = NormalizedRequest::new(&JsonRpcRequest::new(1, " tools/list ", None));
        let b = NormalizedRequest::new(&JsonRpcRequest::new("abc", "tools/list", None));
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_escapes_keys() {
        let mut out = String::new();
        write_canonical(&json!({"b\"": 1, "a": [true, null]}), &mut out);
        assert_eq!(out, r#"{"a":[true,null],"b\"":1}"#);
    }
}
