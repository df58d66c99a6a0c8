//! Backend registry.
//!
//! The set of backends a generation routes to, keyed by id. Built once per
//! generation and never mutated afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::load_balancer::backend::{Backend, BackendDescriptor, BackendId};

/// Backends added, removed or changed between two registries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryDiff {
    pub added: Vec<BackendId>,
    pub removed: Vec<BackendId>,
    pub changed: Vec<BackendId>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Backends whose cached responses no longer apply.
    pub fn stale(&self) -> impl Iterator<Item = &BackendId> {
        self.removed.iter().chain(self.changed.iter())
    }
}

#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<BackendId, Arc<Backend>>,
}

impl BackendRegistry {
    /// Build a registry, carrying health records over from `previous` for
    /// every backend whose descriptor is unchanged.
    pub fn new(descriptors: Vec<BackendDescriptor>, previous: Option<&BackendRegistry>) -> Self {
        let mut backends = BTreeMap::new();
        for descriptor in descriptors {
            let carried = previous
                .and_then(|prev| prev.get(&descriptor.id))
                .filter(|old| old.descriptor == descriptor)
                .map(|old| old.health.clone());

            let backend = match carried {
                Some(health) => Backend::with_health(descriptor, health),
                None => Backend::new(descriptor),
            };
            backends.insert(backend.id().clone(), Arc::new(backend));
        }
        Self { backends }
    }

    pub fn get(&self, id: &BackendId) -> Option<&Arc<Backend>> {
        self.backends.get(id)
    }

    pub fn contains(&self, id: &BackendId) -> bool {
        self.backends.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &BackendId> {
        self.backends.keys()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Changes needed to get from `self` to `next`.
    pub fn diff(&self, next: &BackendRegistry) -> RegistryDiff {
        let mut diff = RegistryDiff::default();
        for (id, backend) in &next.backends {
            match self.backends.get(id) {
                None => diff.added.push(id.clone()),
                Some(old) if old.descriptor != backend.descriptor => diff.changed.push(id.clone()),
                Some(_) => {}
            }
        }
        for id in self.backends.keys() {
            if !next.backends.contains_key(id) {
                diff.removed.push(id.clone());
            }
        }
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CircuitBreakerConfig, TransportKind};
    use crate::health::state::CircuitState;

    fn descriptor(id: &str, endpoint: &str) -> BackendDescriptor {
        BackendDescriptor {
            id: BackendId::new(id),
            transport: TransportKind::Http,
            endpoint: endpoint.into(),
            args: Vec::new(),
            env: Default::default(),
            weight: 1,
            handshake: false,
        }
    }

    #[test]
    fn test_diff() {
        let old = BackendRegistry::new(
            vec![descriptor("a", "http://a"), descriptor("b", "http://b")],
            None,
        );
        let new = BackendRegistry::new(
            vec![descriptor("b", "http://b2"), descriptor("c", "http://c")],
            Some(&old),
        );

        let diff = old.diff(&new);
        assert_eq!(diff.added, vec![BackendId::new("c")]);
        assert_eq!(diff.removed, vec![BackendId::new("a")]);
        assert_eq!(diff.changed, vec![BackendId::new("b")]);
        assert_eq!(diff.stale().count(), 2);
        assert!(new.diff(&new).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_carries_over_for_unchanged_backends() {
        let cfg = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let old = BackendRegistry::new(
            vec![descriptor("a", "http://a"), descriptor("b", "http://b")],
            None,
        );
        for backend in old.iter() {
            backend.health.record_failure(&cfg, false);
        }

        let new = BackendRegistry::new(
            vec![descriptor("a", "http://a"), descriptor("b", "http://moved")],
            Some(&old),
        );
        let a = new.get(&BackendId::new("a")).unwrap();
        let b = new.get(&BackendId::new("b")).unwrap();
        assert_eq!(a.health.state(), CircuitState::Open);
        assert_eq!(b.health.state(), CircuitState::Closed);
    }
}
