//! Content-addressed tier.
//!
//! Keys point at a digest of the response body; bodies live once in a blob
//! store with a reference count. Many keys producing the same payload share
//! one blob, and the blob goes away with its last reference.
//!
//! Lock order: key shard, then blob entry. Nothing here calls back out.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::key::CacheKey;
use crate::load_balancer::BackendId;

pub type Digest = [u8; 32];

#[derive(Debug, Clone)]
pub struct ContentRef {
    pub digest: Digest,
    pub backend: BackendId,
    pub expires_at: Instant,
    pub hits: u32,
}

#[derive(Debug)]
struct Blob {
    value: Arc<Value>,
    size: usize,
    refs: usize,
}

/// A content-tier hit.
#[derive(Debug, Clone)]
pub struct ContentHit {
    pub value: Arc<Value>,
    pub digest: Digest,
    pub size: usize,
    pub hits: u32,
    pub backend: BackendId,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct ContentTier {
    shards: Vec<Mutex<LruCache<CacheKey, ContentRef>>>,
    shard_capacity: usize,
    blobs: DashMap<Digest, Blob>,
}

impl ContentTier {
    pub fn new(shards: usize, max_entries: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(LruCache::unbounded())).collect(),
            shard_capacity: (max_entries / shards).max(1),
            blobs: DashMap::new(),
        }
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<LruCache<CacheKey, ContentRef>> {
        &self.shards[key.shard(self.shards.len())]
    }

    fn retain_blob(&self, digest: Digest, value: Arc<Value>, size: usize) -> Arc<Value> {
        let mut blob = self.blobs.entry(digest).or_insert(Blob { value, size, refs: 0 });
        blob.refs += 1;
        blob.value.clone()
    }

    fn release_blob(&self, digest: &Digest) {
        if let Entry::Occupied(mut blob) = self.blobs.entry(*digest) {
            blob.get_mut().refs -= 1;
            if blob.get().refs == 0 {
                blob.remove();
            }
        }
    }

    /// Look a key up, counting the hit.
    pub fn get(&self, key: &CacheKey) -> Option<ContentHit> {
        let mut shard = self.shard(key).lock();
        let found = match shard.get_mut(key) {
            None => return None,
            Some(r) if r.expires_at <= Instant::now() => None,
            Some(r) => {
                r.hits = r.hits.saturating_add(1);
                Some(r.clone())
            }
        };

        let Some(found) = found else {
            if let Some(expired) = shard.pop(key) {
                self.release_blob(&expired.digest);
            }
            return None;
        };

        let blob = self.blobs.get(&found.digest)?;
        Some(ContentHit {
            value: blob.value.clone(),
            digest: found.digest,
            size: blob.size,
            hits: found.hits,
            backend: found.backend,
            expires_at: found.expires_at,
        })
    }

    /// Point `key` at the blob for `digest` and return the blob's value,
    /// which is the already stored one when the digest is known.
    pub fn insert(
        &self,
        key: CacheKey,
        digest: Digest,
        value: Arc<Value>,
        size: usize,
        backend: BackendId,
        expires_at: Instant,
    ) -> Arc<Value> {
        let mut shard = self.shard(&key).lock();
        if let Some(old) = shard.pop(&key) {
            self.release_blob(&old.digest);
        }
        while shard.len() >= self.shard_capacity {
            match shard.pop_lru() {
                Some((_, evicted)) => self.release_blob(&evicted.digest),
                None => break,
            }
        }
        let value = self.retain_blob(digest, value, size);
        shard.put(
            key,
            ContentRef {
                digest,
                backend,
                expires_at,
                hits: 0,
            },
        );
        value
    }

    fn remove_where(&self, predicate: impl Fn(&ContentRef) -> bool) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let doomed: Vec<CacheKey> = shard
                .iter()
                .filter(|(_, r)| predicate(r))
                .map(|(key, _)| *key)
                .collect();
            for key in doomed {
                if let Some(r) = shard.pop(&key) {
                    self.release_blob(&r.digest);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn invalidate_backend(&self, backend: &BackendId) -> usize {
        self.remove_where(|r| &r.backend == backend)
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        self.remove_where(|r| r.expires_at <= now)
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let mut shard = shard.lock();
            while let Some((_, r)) = shard.pop_lru() {
                self.release_blob(&r.digest);
            }
        }
    }

    pub fn refs(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn blobs(&self) -> usize {
        self.blobs.len()
    }

    pub fn blob_bytes(&self) -> usize {
        self.blobs.iter().map(|blob| blob.size).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{JsonRpcRequest, NormalizedRequest};
    use serde_json::json;
    use std::time::Duration;

    fn key(n: u32) -> CacheKey {
        let request = JsonRpcRequest::new(1, "resources/read", Some(json!({ "uri": n })));
        CacheKey::new(&NormalizedRequest::new(&request), &BackendId::new("b"), &[0; 32])
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[tokio::test]
    async fn test_identical_payloads_share_one_blob() {
        let tier = ContentTier::new(2, 100);
        let body = Arc::new(json!({"contents": "same"}));
        for n in 0..5 {
            tier.insert(key(n), [7; 32], body.clone(), 20, BackendId::new("b"), later());
        }
        assert_eq!(tier.refs(), 5);
        assert_eq!(tier.blobs(), 1);
        assert_eq!(tier.blob_bytes(), 20);

        let stored = tier.insert(key(9), [7; 32], Arc::new(json!({"contents": "same"})), 20, BackendId::new("b"), later());
        assert!(Arc::ptr_eq(&stored, &body));

        let hit = tier.get(&key(3)).unwrap();
        assert_eq!(*hit.value, *body);
        assert_eq!(hit.hits, 1);
        assert_eq!(tier.get(&key(3)).unwrap().hits, 2);
    }

    #[tokio::test]
    async fn test_blob_dropped_with_last_reference() {
        let tier = ContentTier::new(1, 100);
        tier.insert(key(1), [1; 32], Arc::new(json!("x")), 3, BackendId::new("a"), later());
        tier.insert(key(2), [1; 32], Arc::new(json!("x")), 3, BackendId::new("b"), later());

        assert_eq!(tier.invalidate_backend(&BackendId::new("a")), 1);
        assert_eq!(tier.blobs(), 1);
        assert_eq!(tier.invalidate_backend(&BackendId::new("b")), 1);
        assert_eq!(tier.blobs(), 0);
    }

    #[tokio::test]
    async fn test_capacity_evicts_lru_and_releases() {
        let tier = ContentTier::new(1, 2);
        tier.insert(key(1), [1; 32], Arc::new(json!(1)), 1, BackendId::new("b"), later());
        tier.insert(key(2), [2; 32], Arc::new(json!(2)), 1, BackendId::new("b"), later());
        tier.insert(key(3), [3; 32], Arc::new(json!(3)), 1, BackendId::new("b"), later());

        assert!(tier.get(&key(1)).is_none());
        assert_eq!(tier.refs(), 2);
        assert_eq!(tier.blobs(), 2);
    }

    #[tokio::test]
    async fn test_overwrite_moves_reference() {
        let tier = ContentTier::new(1, 10);
        tier.insert(key(1), [1; 32], Arc::new(json!("old")), 1, BackendId::new("b"), later());
        tier.insert(key(1), [2; 32], Arc::new(json!("new")), 1, BackendId::new("b"), later());
        assert_eq!(tier.blobs(), 1);
        assert_eq!(*tier.get(&key(1)).unwrap().value, json!("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_refs_release_blobs() {
        let tier = ContentTier::new(1, 10);
        let soon = Instant::now() + Duration::from_secs(1);
        tier.insert(key(1), [1; 32], Arc::new(json!(1)), 1, BackendId::new("b"), soon);
        tier.insert(key(2), [2; 32], Arc::new(json!(2)), 1, BackendId::new("b"), soon);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tier.get(&key(1)).is_none());
        assert_eq!(tier.purge_expired(), 1);
        assert_eq!(tier.blobs(), 0);
    }
}
