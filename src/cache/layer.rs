//! Cache layer: both tiers plus coalescing behind one entry point.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest as _, Sha256};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::coalesce::{Coalescer, Role, SharedOutcome};
use crate::cache::content::ContentTier;
use crate::cache::exact::ExactTier;
use crate::cache::key::CacheKey;
use crate::config::CacheConfig;
use crate::dispatch::DispatchError;
use crate::load_balancer::BackendId;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct CacheStats {
    pub exact_entries: usize,
    pub exact_bytes: usize,
    pub content_refs: usize,
    pub content_blobs: usize,
    pub content_bytes: usize,
    pub in_flight: usize,
    pub hits_exact: u64,
    pub hits_content: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub promotions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits_exact: AtomicU64,
    hits_content: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    promotions: AtomicU64,
}

#[derive(Debug)]
pub struct CacheLayer {
    config: CacheConfig,
    exact: ExactTier,
    content: ContentTier,
    coalescer: Coalescer,
    counters: Counters,
}

impl CacheLayer {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            exact: ExactTier::new(config.shards, config.max_bytes),
            content: ContentTier::new(config.shards, config.content_max_entries),
            coalescer: Coalescer::new(),
            counters: Counters::default(),
            config,
        }
    }

    /// Whether responses to `method` may be stored.
    pub fn is_cacheable(&self, method: &str) -> bool {
        self.config.enabled && !self.config.bypass_methods.iter().any(|m| m == method)
    }

    /// Return the cached value for `key`, or compute it exactly once.
    ///
    /// Concurrent callers for the same key share one computation. With
    /// `store` unset the value is coalesced but never written. Errors are
    /// handed to every waiter and never stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        backend: &BackendId,
        store: bool,
        cancel: &CancellationToken,
        compute: F,
    ) -> SharedOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, DispatchError>>,
    {
        self.get_or_compute_while(key, backend, store, || true, cancel, compute)
            .await
    }

    /// Like [`CacheLayer::get_or_compute`], but a computed value is only
    /// written if `still_valid` holds once the computation finishes. Waiters
    /// still receive the value either way.
    pub async fn get_or_compute_while<V, F, Fut>(
        &self,
        key: CacheKey,
        backend: &BackendId,
        store: bool,
        still_valid: V,
        cancel: &CancellationToken,
        compute: F,
    ) -> SharedOutcome
    where
        V: FnOnce() -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, DispatchError>>,
    {
        if store {
            if let Some(value) = self.lookup(&key) {
                return Ok(value);
            }
        }

        match self.coalescer.join(key) {
            Role::Follower(follower) => {
                self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache("coalesced");
                tracing::debug!(key = %key, "Joined in-flight computation");
                follower.wait(cancel).await
            }
            Role::Leader(leader) => {
                // A previous leader may have stored the value between our
                // lookup and taking leadership.
                if store {
                    if let Some(value) = self.peek(&key) {
                        leader.complete(Ok(value.clone()));
                        return Ok(value);
                    }
                }

                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache("miss");

                let outcome = match compute().await {
                    Ok(value) if store => {
                        let value = Arc::new(value);
                        if still_valid() {
                            Ok(self.insert(key, backend, value))
                        } else {
                            tracing::debug!(key = %key, "Computation outlived its generation, not caching");
                            Ok(value)
                        }
                    }
                    Ok(value) => Ok(Arc::new(value)),
                    Err(e) => Err(e),
                };
                leader.complete(outcome.clone());
                outcome
            }
        }
    }

    fn lookup(&self, key: &CacheKey) -> Option<Arc<Value>> {
        if let Some(value) = self.exact.get(key) {
            self.counters.hits_exact.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache("hit_exact");
            return Some(value);
        }

        let hit = self.content.get(key)?;
        self.counters.hits_content.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache("hit_content");

        if hit.hits >= self.config.promote_after_hits
            && self
                .exact
                .insert(*key, hit.value.clone(), hit.digest, hit.size, hit.backend, hit.expires_at)
        {
            self.counters.promotions.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(key = %key, hits = hit.hits, "Promoted entry to exact tier");
        }
        Some(hit.value)
    }

    fn peek(&self, key: &CacheKey) -> Option<Arc<Value>> {
        self.exact
            .get(key)
            .or_else(|| self.content.get(key).map(|hit| hit.value))
    }

    /// Store `value` in both tiers and return the shared copy that now
    /// backs every key with the same body.
    fn insert(&self, key: CacheKey, backend: &BackendId, value: Arc<Value>) -> Arc<Value> {
        let body = match serde_json::to_vec(&*value) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Response not serializable, not caching");
                return value;
            }
        };
        let digest: [u8; 32] = Sha256::digest(&body).into();
        let expires_at = Instant::now() + self.config.ttl();

        let shared = self
            .content
            .insert(key, digest, value, body.len(), backend.clone(), expires_at);
        self.exact
            .insert(key, shared.clone(), digest, body.len(), backend.clone(), expires_at);
        shared
    }

    /// Drop every entry tagged with `backend`.
    pub fn invalidate_backend(&self, backend: &BackendId) -> usize {
        let removed = self.exact.invalidate_backend(backend) + self.content.invalidate_backend(backend);
        if removed > 0 {
            tracing::info!(backend = %backend, removed, "Invalidated cache entries");
        }
        removed
    }

    pub fn flush(&self) {
        self.exact.clear();
        self.content.clear();
        tracing::info!("Cache flushed");
    }

    pub fn purge_expired(&self) -> usize {
        self.exact.purge_expired() + self.content.purge_expired()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            exact_entries: self.exact.len(),
            exact_bytes: self.exact.bytes(),
            content_refs: self.content.refs(),
            content_blobs: self.content.blobs(),
            content_bytes: self.content.blob_bytes(),
            in_flight: self.coalescer.in_flight(),
            hits_exact: self.counters.hits_exact.load(Ordering::Relaxed),
            hits_content: self.counters.hits_content.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            promotions: self.counters.promotions.load(Ordering::Relaxed),
        }
    }
}
