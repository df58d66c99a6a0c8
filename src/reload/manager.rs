//! Hot-reload manager.
//!
//! # Responsibilities
//! - Own the current generation behind a single atomic pointer
//! - Turn a new configuration into the next generation and swap it in
//! - Drain and retire superseded generations in the background
//!
//! # Design Decisions
//! - Validation happens before anything is built; a rejected config leaves
//!   the current generation untouched
//! - The next generation is fully built (and its pools warmed) before the swap
//! - Reloads are serialized; readers never wait on them

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::CacheLayer;
use crate::config::{load_config, validate_config, AggregatorConfig, ConfigError, ValidationError};
use crate::load_balancer::RegistryDiff;
use crate::observability::metrics;
use crate::reload::generation::{ConfigGeneration, GenerationGuard};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("configuration rejected: {}", summarize(.0))]
    Validation(Vec<ValidationError>),

    #[error("failed to load configuration: {0}")]
    Load(ConfigError),
}

fn summarize(errors: &[ValidationError]) -> String {
    errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
}

impl From<ConfigError> for ReloadError {
    fn from(error: ConfigError) -> Self {
        match error {
            ConfigError::Validation(errors) => ReloadError::Validation(errors),
            other => ReloadError::Load(other),
        }
    }
}

#[derive(Debug)]
pub struct ReloadManager {
    current: ArcSwap<ConfigGeneration>,
    cache: Arc<CacheLayer>,
    serial: tokio::sync::Mutex<()>,
    draining: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ReloadManager {
    /// Build generation 1 from an initial configuration.
    pub async fn new(config: AggregatorConfig, cache: Arc<CacheLayer>) -> Result<Self, ReloadError> {
        validate_config(&config).map_err(ReloadError::Validation)?;

        let generation = Arc::new(ConfigGeneration::build(1, config, None));
        generation.pools().warm_all().await;
        metrics::record_generation(1);
        tracing::info!(
            generation = 1,
            backends = generation.registry().len(),
            virtual_nodes = generation.ring().len(),
            "Initial generation ready"
        );

        Ok(Self {
            current: ArcSwap::new(generation),
            cache,
            serial: tokio::sync::Mutex::new(()),
            draining: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the current generation.
    pub fn current(&self) -> Arc<ConfigGeneration> {
        self.current.load_full()
    }

    /// Whether `generation` is still the one serving new requests.
    pub fn is_current(&self, generation: &ConfigGeneration) -> bool {
        std::ptr::eq(generation, &**self.current.load())
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    /// Pin the current generation for one request.
    pub fn enter(&self) -> GenerationGuard {
        loop {
            let generation = self.current.load_full();
            let guard = generation.enter();
            // A swap between load and enter may already be draining this
            // generation; the counter is only trusted once it is still current.
            if Arc::ptr_eq(&generation, &self.current.load()) {
                return guard;
            }
        }
    }

    /// Load `path` and apply it.
    pub async fn reload_from_path(&self, path: &Path) -> Result<u64, ReloadError> {
        let config = load_config(path).map_err(|e| {
            metrics::record_reload("rejected");
            ReloadError::from(e)
        })?;
        self.apply(config).await
    }

    /// Validate, build, swap, then drain the previous generation.
    pub async fn apply(&self, config: AggregatorConfig) -> Result<u64, ReloadError> {
        let _serial = self.serial.lock().await;

        if let Err(errors) = validate_config(&config) {
            metrics::record_reload("rejected");
            for error in &errors {
                tracing::warn!(error = %error, "Reload rejected");
            }
            return Err(ReloadError::Validation(errors));
        }

        let previous = self.current.load_full();
        let version = previous.version() + 1;
        let next = Arc::new(ConfigGeneration::build(version, config, Some(&previous)));
        next.pools().warm_all().await;

        self.current.store(next.clone());
        metrics::record_reload("applied");
        metrics::record_generation(version);

        let diff = previous.registry().diff(next.registry());
        tracing::info!(
            generation = version,
            added = diff.added.len(),
            removed = diff.removed.len(),
            changed = diff.changed.len(),
            "Generation swapped"
        );
        // Changed backends keep their id, so new requests could otherwise
        // hit entries computed by the old endpoint.
        self.invalidate(&diff);

        let grace = previous.config().reload.drain_grace();
        let cache = self.cache.clone();
        let handle = tokio::spawn(async move {
            let drained = previous.wait_idle(grace).await;
            if !drained {
                tracing::warn!(
                    generation = previous.version(),
                    in_flight = previous.in_flight(),
                    "Drain grace elapsed, closing pools anyway"
                );
            }
            previous.pools().close_all();
            // A request racing the swap may still have stored an entry for a
            // backend that is gone. Changed backends are keyed by their new
            // fingerprint, so their fresh entries are left alone.
            for id in &diff.removed {
                cache.invalidate_backend(id);
            }
            tracing::info!(generation = previous.version(), "Generation retired");
        });

        let mut draining = self.draining.lock();
        draining.retain(|h| !h.is_finished());
        draining.push(handle);

        Ok(version)
    }

    /// Apply every configuration received on `updates` until the channel
    /// closes or `stop` fires.
    ///
    /// Rejected documents are logged and skipped; the current generation keeps
    /// serving. `stop` is only observed between reloads, so an `apply` in
    /// progress always finishes and registers its drain task. Updates already
    /// queued when `stop` fires are still applied.
    pub async fn follow(self: Arc<Self>, mut updates: mpsc::UnboundedReceiver<AggregatorConfig>, stop: CancellationToken) {
        loop {
            let config = tokio::select! {
                biased;
                config = updates.recv() => config,
                _ = stop.cancelled() => {
                    updates.close();
                    updates.recv().await
                }
            };
            let Some(config) = config else { break };
            match self.apply(config).await {
                Ok(version) => tracing::info!(generation = version, "Configuration reloaded"),
                Err(e) => tracing::error!(error = %e, "Reload failed, keeping current configuration"),
            }
        }
        tracing::debug!("Config updates stopped");
    }

    fn invalidate(&self, diff: &RegistryDiff) {
        for id in diff.stale() {
            self.cache.invalidate_backend(id);
        }
    }

    /// Wait for every retiring generation, then close the current pools.
    pub async fn drain_all(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.draining.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Drain task failed");
            }
        }

        let current = self.current.load_full();
        if !current.wait_idle(current.config().reload.drain_grace()).await {
            tracing::warn!(in_flight = current.in_flight(), "Shutting down with requests in flight");
        }
        current.pools().close_all();
    }
}
