//! Exact-match tier.
//!
//! Sharded LRU keyed by [`CacheKey`]. Each shard owns an equal slice of the
//! byte budget and evicts least-recently-used entries to stay inside it.
//! Expired entries are dropped on access and by [`ExactTier::purge_expired`].
//!
//! Entries with the same body digest share one `Arc` within a shard, and the
//! body counts against the budget once; each further key only costs
//! [`ENTRY_OVERHEAD`].

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::content::Digest;
use crate::cache::key::CacheKey;
use crate::load_balancer::BackendId;

/// Bytes charged per key on top of its (shared) body.
pub const ENTRY_OVERHEAD: usize = 64;

#[derive(Debug)]
struct ExactEntry {
    value: Arc<Value>,
    digest: Digest,
    backend: BackendId,
    expires_at: Instant,
}

#[derive(Debug)]
struct SharedBody {
    value: Arc<Value>,
    size: usize,
    refs: usize,
}

#[derive(Debug)]
struct ExactShard {
    entries: LruCache<CacheKey, ExactEntry>,
    bodies: HashMap<Digest, SharedBody>,
    bytes: usize,
}

impl ExactShard {
    /// Bytes a new entry with `digest` would add.
    fn charge(&self, digest: &Digest, size: usize) -> usize {
        if self.bodies.contains_key(digest) {
            ENTRY_OVERHEAD
        } else {
            ENTRY_OVERHEAD + size
        }
    }

    fn release(&mut self, entry: &ExactEntry) {
        self.bytes -= ENTRY_OVERHEAD;
        if let Some(body) = self.bodies.get_mut(&entry.digest) {
            body.refs -= 1;
            if body.refs == 0 {
                self.bytes -= body.size;
                self.bodies.remove(&entry.digest);
            }
        }
    }

    /// Canonical `Arc` for `digest`, taking a reference on it.
    fn retain(&mut self, digest: Digest, value: Arc<Value>, size: usize) -> Arc<Value> {
        self.bytes += ENTRY_OVERHEAD;
        let body = self.bodies.entry(digest).or_insert_with(|| SharedBody { value, size, refs: 0 });
        if body.refs == 0 {
            self.bytes += body.size;
        }
        body.refs += 1;
        body.value.clone()
    }

    fn remove(&mut self, key: &CacheKey) -> Option<ExactEntry> {
        let entry = self.entries.pop(key)?;
        self.release(&entry);
        Some(entry)
    }

    fn pop_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((_, evicted)) => {
                self.release(&evicted);
                true
            }
            None => false,
        }
    }

    fn remove_where(&mut self, predicate: impl Fn(&ExactEntry) -> bool) -> usize {
        let doomed: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| predicate(entry))
            .map(|(key, _)| *key)
            .collect();
        for key in &doomed {
            self.remove(key);
        }
        doomed.len()
    }
}

#[derive(Debug)]
pub struct ExactTier {
    shards: Vec<Mutex<ExactShard>>,
    shard_budget: usize,
}

impl ExactTier {
    pub fn new(shards: usize, max_bytes: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards)
                .map(|_| {
                    Mutex::new(ExactShard {
                        entries: LruCache::unbounded(),
                        bodies: HashMap::new(),
                        bytes: 0,
                    })
                })
                .collect(),
            shard_budget: max_bytes / shards,
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<ExactShard> {
        &self.shards[key.shard(self.shards.len())]
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Value>> {
        let mut shard = self.shard(key).lock();
        let expired = match shard.entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.expires_at <= Instant::now() => true,
            Some(entry) => return Some(entry.value.clone()),
        };
        if expired {
            shard.remove(key);
        }
        None
    }

    /// Store an entry, evicting LRU entries of the same shard to make room.
    /// `size` is the serialized body size and `digest` its SHA-256.
    /// Returns false when the entry alone exceeds the shard budget.
    pub fn insert(
        &self,
        key: CacheKey,
        value: Arc<Value>,
        digest: Digest,
        size: usize,
        backend: BackendId,
        expires_at: Instant,
    ) -> bool {
        if ENTRY_OVERHEAD + size > self.shard_budget {
            return false;
        }
        let mut shard = self.shard(&key).lock();
        shard.remove(&key);
        // Evicting may drop the last holder of `digest`, so the charge is
        // recomputed each round.
        while shard.bytes + shard.charge(&digest, size) > self.shard_budget {
            if !shard.pop_lru() {
                break;
            }
        }
        let value = shard.retain(digest, value, size);
        shard.entries.put(
            key,
            ExactEntry {
                value,
                digest,
                backend,
                expires_at,
            },
        );
        true
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.shard(key).lock().entries.contains(key)
    }

    pub fn invalidate_backend(&self, backend: &BackendId) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.lock().remove_where(|entry| &entry.backend == backend))
            .sum()
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.shards
            .iter()
            .map(|shard| shard.lock().remove_where(|entry| entry.expires_at <= now))
            .sum()
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            shard.entries.clear();
            shard.bodies.clear();
            shard.bytes = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcRequest, NormalizedRequest};
    use serde_json::json;
    use std::time::Duration;

    fn key(n: u32) -> CacheKey {
        let request = JsonRpcRequest::new(1, "tools/call", Some(json!({ "n": n })));
        CacheKey::new(&NormalizedRequest::new(&request), &BackendId::new("b"), &[0; 32])
    }

    fn digest(n: u8) -> Digest {
        [n; 32]
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_lru_eviction_respects_budget() {
        // Room for two distinct 40-byte bodies.
        let tier = ExactTier::new(1, 2 * (ENTRY_OVERHEAD + 40) + 10);
        let b = BackendId::new("b");

        assert!(tier.insert(key(1), Arc::new(json!(1)), digest(1), 40, b.clone(), later()));
        assert!(tier.insert(key(2), Arc::new(json!(2)), digest(2), 40, b.clone(), later()));
        // Touch 1 so 2 becomes least recently used.
        assert!(tier.get(&key(1)).is_some());
        assert!(tier.insert(key(3), Arc::new(json!(3)), digest(3), 40, b.clone(), later()));

        assert!(tier.contains(&key(1)));
        assert!(!tier.contains(&key(2)));
        assert!(tier.contains(&key(3)));
        assert_eq!(tier.bytes(), 2 * (ENTRY_OVERHEAD + 40));

        assert!(!tier.insert(key(4), Arc::new(json!(4)), digest(4), 1_000, b, later()));
    }

    #[tokio::test]
    async fn test_identical_bodies_are_stored_once() {
        let tier = ExactTier::new(1, 100_000);
        let b = BackendId::new("b");
        let body_size = 10_000;

        for n in 0..50 {
            // Every key arrives with its own allocation of the same body.
            let value = Arc::new(json!({"contents": "same"}));
            assert!(tier.insert(key(n), value, digest(9), body_size, b.clone(), later()));
        }

        assert_eq!(tier.len(), 50);
        assert_eq!(tier.bytes(), body_size + 50 * ENTRY_OVERHEAD);
        let first = tier.get(&key(0)).unwrap();
        assert!((1..50).all(|n| Arc::ptr_eq(&first, &tier.get(&key(n)).unwrap())));

        // The body is charged until its last key goes.
        tier.invalidate_backend(&b);
        assert_eq!(tier.bytes(), 0);
    }

    #[tokio::test]
    async fn test_evicting_last_holder_recharges_body() {
        let budget = 2 * ENTRY_OVERHEAD + 100;
        let tier = ExactTier::new(1, budget);
        let b = BackendId::new("b");

        assert!(tier.insert(key(1), Arc::new(json!("x")), digest(1), 100, b.clone(), later()));
        assert!(tier.insert(key(2), Arc::new(json!("x")), digest(1), 100, b.clone(), later()));
        assert_eq!(tier.bytes(), budget);

        assert!(tier.insert(key(3), Arc::new(json!("y")), digest(2), 100, b, later()));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), ENTRY_OVERHEAD + 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let tier = ExactTier::new(4, 10_000);
        let expires = Instant::now() + Duration::from_secs(5);
        tier.insert(key(1), Arc::new(json!("v")), digest(1), 10, BackendId::new("b"), expires);
        tier.insert(key(2), Arc::new(json!("w")), digest(2), 10, BackendId::new("b"), later());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(tier.get(&key(1)).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tier.get(&key(1)).is_none());
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), ENTRY_OVERHEAD + 10);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(tier.purge_expired(), 1);
        assert!(tier.is_empty());
        assert_eq!(tier.bytes(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_backend() {
        let tier = ExactTier::new(4, 10_000);
        tier.insert(key(1), Arc::new(json!(1)), digest(1), 10, BackendId::new("a"), later());
        tier.insert(key(2), Arc::new(json!(2)), digest(2), 10, BackendId::new("b"), later());
        tier.insert(key(3), Arc::new(json!(3)), digest(3), 10, BackendId::new("a"), later());

        assert_eq!(tier.invalidate_backend(&BackendId::new("a")), 2);
        assert_eq!(tier.len(), 1);
        assert!(tier.contains(&key(2)));
    }
}
