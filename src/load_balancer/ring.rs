//! Consistent hash ring.
//!
//! Every backend owns `virtual_nodes * weight` positions on a 64-bit ring.
//! A key is served by the first position clockwise from its hash whose
//! backend passes the health filter. Removing a backend only frees its own
//! positions, so only the keys it owned move.

use std::collections::HashSet;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::load_balancer::backend::{BackendDescriptor, BackendId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RingError {
    #[error("no healthy backend available")]
    NoHealthyBackend,
}

/// One ring position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualNode {
    pub hash: u64,
    pub backend: BackendId,
}

/// 64-bit ring position of an arbitrary key.
pub fn ring_hash(key: &[u8]) -> u64 {
    let digest = Sha256::digest(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone)]
pub struct HashRing {
    virtual_nodes: u32,
    nodes: Vec<VirtualNode>,
}

impl HashRing {
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            nodes: Vec::new(),
        }
    }

    /// Build a ring holding every descriptor.
    pub fn build<'a>(virtual_nodes: u32, descriptors: impl IntoIterator<Item = &'a BackendDescriptor>) -> Self {
        let mut ring = Self::new(virtual_nodes);
        for descriptor in descriptors {
            ring.add(descriptor);
        }
        ring
    }

    /// Insert the backend's virtual nodes. Re-adding replaces the old set.
    pub fn add(&mut self, descriptor: &BackendDescriptor) {
        self.remove(&descriptor.id);

        let replicas = self.virtual_nodes as u64 * descriptor.weight.max(1) as u64;
        self.nodes.reserve(replicas as usize);
        for replica in 0..replicas {
            let label = format!("{}#{}", descriptor.id, replica);
            self.nodes.push(VirtualNode {
                hash: ring_hash(label.as_bytes()),
                backend: descriptor.id.clone(),
            });
        }
        self.nodes
            .sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.backend.cmp(&b.backend)));
    }

    /// Drop only this backend's virtual nodes.
    pub fn remove(&mut self, id: &BackendId) {
        self.nodes.retain(|node| &node.backend != id);
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[VirtualNode] {
        &self.nodes
    }

    /// Backend for `key`, skipping backends rejected by `healthy`.
    pub fn lookup<F>(&self, key: &[u8], healthy: F) -> Result<BackendId, RingError>
    where
        F: Fn(&BackendId) -> bool,
    {
        self.walk(key, |id| healthy(id))
    }

    /// Like [`HashRing::lookup`], additionally skipping `excluded` backends.
    pub fn lookup_excluding<F>(
        &self,
        key: &[u8],
        excluded: &HashSet<BackendId>,
        healthy: F,
    ) -> Result<BackendId, RingError>
    where
        F: Fn(&BackendId) -> bool,
    {
        self.walk(key, |id| !excluded.contains(id) && healthy(id))
    }

    fn walk<F>(&self, key: &[u8], accept: F) -> Result<BackendId, RingError>
    where
        F: Fn(&BackendId) -> bool,
    {
        if self.nodes.is_empty() {
            return Err(RingError::NoHealthyBackend);
        }

        let hash = ring_hash(key);
        let start = self.nodes.partition_point(|node| node.hash < hash);
        let len = self.nodes.len();

        // Each backend is judged once; at most one full turn of the ring.
        let mut rejected: HashSet<&BackendId> = HashSet::new();
        for step in 0..len {
            let node = &self.nodes[(start + step) % len];
            if rejected.contains(&node.backend) {
                continue;
            }
            if accept(&node.backend) {
                return Ok(node.backend.clone());
            }
            rejected.insert(&node.backend);
        }
        Err(RingError::NoHealthyBackend)
    }
}
