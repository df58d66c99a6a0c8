//! Cache keys.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::load_balancer::{BackendId, Fingerprint};
use crate::protocol::NormalizedRequest;

/// SHA-256 over normalized method, params and backend identity.
///
/// Identity is the id plus the descriptor fingerprint, so a backend that
/// keeps its id across a reload but moves elsewhere never shares entries or
/// in-flight computations with its previous incarnation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    pub fn new(request: &NormalizedRequest, backend: &BackendId, fingerprint: &Fingerprint) -> Self {
        let mut hasher = Sha256::new();
        // Length prefixes keep field boundaries unambiguous.
        for part in [request.method(), request.canonical_params(), backend.as_str()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hasher.update(fingerprint);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Shard index in `0..shards`.
    pub fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        (u64::from_be_bytes(prefix) % shards.max(1) as u64) as usize
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcRequest;
    use serde_json::json;

    fn key(method: &str, params: serde_json::Value, backend: &str) -> CacheKey {
        let request = JsonRpcRequest::new(1, method, Some(params));
        CacheKey::new(&NormalizedRequest::new(&request), &BackendId::new(backend), &[0; 32])
    }

    #[test]
    fn test_key_is_deterministic_and_order_independent() {
        let a = key("tools/call", json!({"name": "read", "arguments": {"path": "/a", "limit": 3}}), "fs");
        let b = key("tools/call", json!({"arguments": {"limit": 3, "path": "/a"}, "name": "read"}), "fs");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.to_string().len(), 64);
    }

    #[test]
    fn test_key_depends_on_every_input() {
        let base = key("tools/call", json!({"name": "read"}), "fs");
        assert_ne!(base, key("tools/list", json!({"name": "read"}), "fs"));
        assert_ne!(base, key("tools/call", json!({"name": "write"}), "fs"));
        assert_ne!(base, key("tools/call", json!({"name": "read"}), "git"));
        // Array order is significant.
        assert_ne!(
            key("m", json!({"a": [1, 2]}), "fs"),
            key("m", json!({"a": [2, 1]}), "fs")
        );
    }

    #[test]
    fn test_moved_backend_gets_new_keys() {
        let request = JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "read"})));
        let normalized = NormalizedRequest::new(&request);
        let id = BackendId::new("fs");
        assert_ne!(
            CacheKey::new(&normalized, &id, &[1; 32]),
            CacheKey::new(&normalized, &id, &[2; 32])
        );
    }

    #[test]
    fn test_request_id_does_not_matter() {
        let one = JsonRpcRequest::new(1, "tools/list", None);
        let two = JsonRpcRequest::new("abc", " tools/list ", Some(serde_json::Value::Null));
        let backend = BackendId::new("fs");
        assert_eq!(
            CacheKey::new(&NormalizedRequest::new(&one), &backend, &[0; 32]),
            CacheKey::new(&NormalizedRequest::new(&two), &backend, &[0; 32])
        );
    }
}
