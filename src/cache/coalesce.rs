//! Request coalescing.
//!
//! The first caller for a key becomes the leader and runs the computation;
//! callers arriving while it runs become followers and wait for the leader's
//! outcome on a watch channel. A leader that goes away without an outcome
//! publishes `Cancelled`, so followers are never left waiting.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::key::CacheKey;
use crate::dispatch::DispatchError;

/// Outcome shared between a leader and its followers.
pub type SharedOutcome = Result<Arc<Value>, DispatchError>;

type Slot = watch::Receiver<Option<SharedOutcome>>;

#[derive(Debug, Clone, Default)]
pub struct Coalescer {
    in_flight: Arc<DashMap<CacheKey, Slot>>,
}

pub enum Role {
    Leader(LeaderGuard),
    Follower(Follower),
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become leader for `key`, or follow the current one.
    pub fn join(&self, key: CacheKey) -> Role {
        match self.in_flight.entry(key) {
            Entry::Occupied(slot) => Role::Follower(Follower { rx: slot.get().clone() }),
            Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Role::Leader(LeaderGuard {
                    in_flight: self.in_flight.clone(),
                    key,
                    tx: Some(tx),
                })
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

/// Leadership of one key. Publish with [`LeaderGuard::complete`].
pub struct LeaderGuard {
    in_flight: Arc<DashMap<CacheKey, Slot>>,
    key: CacheKey,
    tx: Option<watch::Sender<Option<SharedOutcome>>>,
}

impl LeaderGuard {
    pub fn complete(mut self, outcome: SharedOutcome) {
        self.publish(outcome);
    }

    fn publish(&mut self, outcome: SharedOutcome) {
        if let Some(tx) = self.tx.take() {
            // Unregister first: later callers start fresh instead of joining
            // a finished computation.
            self.in_flight.remove(&self.key);
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        if self.tx.is_some() {
            tracing::debug!(key = %self.key, "Coalescing leader dropped, releasing followers");
            self.publish(Err(DispatchError::Cancelled));
        }
    }
}

pub struct Follower {
    rx: Slot,
}

impl Follower {
    /// Wait for the leader's outcome, or for our own cancellation.
    pub async fn wait(mut self, cancel: &CancellationToken) -> SharedOutcome {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DispatchError::Cancelled),
            outcome = self.rx.wait_for(Option::is_some) => match outcome {
                Ok(value) => value.clone().unwrap_or(Err(DispatchError::Cancelled)),
                Err(_) => Err(DispatchError::Cancelled),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::BackendId;
    use crate::protocol::{JsonRpcRequest, NormalizedRequest};
    use serde_json::json;

    fn key() -> CacheKey {
        let request = JsonRpcRequest::new(1, "tools/list", None);
        CacheKey::new(&NormalizedRequest::new(&request), &BackendId::new("b"), &[0; 32])
    }

    #[tokio::test]
    async fn test_followers_receive_leader_outcome() {
        let coalescer = Coalescer::new();
        let Role::Leader(leader) = coalescer.join(key()) else {
            panic!("first caller must lead");
        };
        let Role::Follower(follower) = coalescer.join(key()) else {
            panic!("second caller must follow");
        };

        let cancel = CancellationToken::new();
        let waiting = tokio::spawn(async move { follower.wait(&cancel).await });
        leader.complete(Ok(Arc::new(json!({"tools": []}))));

        assert_eq!(*waiting.await.unwrap().unwrap(), json!({"tools": []}));
        assert_eq!(coalescer.in_flight(), 0);
        assert!(matches!(coalescer.join(key()), Role::Leader(_)));
    }

    #[tokio::test]
    async fn test_dropped_leader_cancels_followers() {
        let coalescer = Coalescer::new();
        let leader = coalescer.join(key());
        let Role::Follower(follower) = coalescer.join(key()) else {
            panic!("second caller must follow");
        };

        drop(leader);
        let outcome = follower.wait(&CancellationToken::new()).await;
        assert_eq!(outcome.unwrap_err(), DispatchError::Cancelled);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_follower_cancellation_leaves_leader_running() {
        let coalescer = Coalescer::new();
        let _leader = coalescer.join(key());
        let Role::Follower(follower) = coalescer.join(key()) else {
            panic!("second caller must follow");
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(follower.wait(&cancel).await.unwrap_err(), DispatchError::Cancelled);
        assert_eq!(coalescer.in_flight(), 1);
    }
}
