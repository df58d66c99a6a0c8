//! Configuration generations.
//!
//! A generation bundles everything routing needs (registry, ring, pools,
//! breaker settings, timeouts) built from one configuration. It is never
//! mutated after construction; a reload builds the next one beside it.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;

use crate::config::AggregatorConfig;
use crate::health::HealthMonitor;
use crate::load_balancer::{BackendDescriptor, BackendRegistry, HashRing, PoolSet};

#[derive(Debug)]
pub struct ConfigGeneration {
    version: u64,
    created_at: SystemTime,
    config: AggregatorConfig,
    registry: BackendRegistry,
    ring: HashRing,
    pools: PoolSet,
    monitor: HealthMonitor,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl ConfigGeneration {
    /// Build generation `version`, carrying health records over from
    /// `previous` for unchanged backends.
    pub fn build(version: u64, config: AggregatorConfig, previous: Option<&ConfigGeneration>) -> Self {
        let descriptors: Vec<BackendDescriptor> = config.backends.iter().map(BackendDescriptor::from).collect();
        let registry = BackendRegistry::new(descriptors, previous.map(|p| &p.registry));
        let ring = HashRing::build(config.ring.virtual_nodes, registry.iter().map(|b| &b.descriptor));
        let pools = PoolSet::new(&registry, &config.pool, config.timeouts.connect());
        let monitor = HealthMonitor::new(config.circuit_breaker.clone());

        Self {
            version,
            created_at: SystemTime::now(),
            config,
            registry,
            ring,
            pools,
            monitor,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn pools(&self) -> &PoolSet {
        &self.pools
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Count one request against this generation until the guard drops.
    pub fn enter(self: &Arc<Self>) -> GenerationGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        GenerationGuard {
            generation: self.clone(),
        }
    }

    /// Wait until no request holds this generation, at most `grace`.
    /// Returns false if the grace period ran out first.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.in_flight() == 0 {
                return true;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return self.in_flight() == 0,
            }
        }
    }
}

/// Keeps a generation alive and counted for the duration of one request.
#[derive(Debug)]
pub struct GenerationGuard {
    generation: Arc<ConfigGeneration>,
}

impl GenerationGuard {
    pub fn generation(&self) -> &Arc<ConfigGeneration> {
        &self.generation
    }
}

impl Deref for GenerationGuard {
    type Target = ConfigGeneration;

    fn deref(&self) -> &ConfigGeneration {
        &self.generation
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        if self.generation.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.generation.idle.notify_waiters();
        }
    }
}
