//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe every backend of the current generation
//! - Feed probe outcomes into the same breaker as real traffic
//!
//! # Design Decisions
//! - Probes go through the breaker's admission: an Open backend is only
//!   probed once its cooldown elapsed, as the single half-open trial
//! - Any JSON-RPC response, even an error object, proves liveness
//! - Interval and probe settings are re-read every round so reloads apply

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::health::passive::Outcome;
use crate::health::state::ProbeResult;
use crate::load_balancer::Backend;
use crate::load_balancer::pool::PoolError;
use crate::protocol::JsonRpcRequest;
use crate::reload::{ConfigGeneration, ReloadManager};
use crate::resilience::{with_deadline, Deadline};
use crate::transport::next_outbound_id;

pub struct ActiveProber {
    manager: Arc<ReloadManager>,
}

impl ActiveProber {
    pub fn new(manager: Arc<ReloadManager>) -> Self {
        Self { manager }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let initial = self.manager.current().config().health_check.clone();
        tracing::info!(
            enabled = initial.enabled,
            interval_ms = initial.interval_ms,
            method = %initial.probe_method,
            "Active prober starting"
        );

        loop {
            let period = self.manager.current().config().health_check.interval();
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    self.probe_all().await;
                }
                _ = shutdown.recv() => {
                    tracing::info!("Active prober received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Probe every backend once. Returns how many probes were sent.
    pub async fn probe_all(&self) -> usize {
        let generation = self.manager.enter();
        if !generation.config().health_check.enabled {
            return 0;
        }

        let probes = generation
            .registry()
            .iter()
            .map(|backend| probe(&generation, backend));
        join_all(probes).await.into_iter().flatten().count()
    }
}

async fn probe(generation: &ConfigGeneration, backend: &Arc<Backend>) -> Option<Outcome> {
    let pool = generation.pools().get(backend.id())?;
    let permit = generation.monitor().admit(backend)?;
    let settings = &generation.config().health_check;

    let cancel = CancellationToken::new();
    let request = JsonRpcRequest::new(next_outbound_id(), settings.probe_method.as_str(), None);
    let attempt = with_deadline(settings.timeout(), &cancel, async {
        let mut conn = pool.acquire(&cancel).await?;
        let sent = conn.send(&request).await;
        if sent.is_err() {
            conn.mark_broken();
        }
        Ok::<_, PoolError>(sent)
    })
    .await;

    let outcome = match attempt {
        Ok(Ok(Ok(_response))) => Outcome::Success,
        Ok(Ok(Err(e))) => {
            tracing::warn!(backend = %backend.id(), error = %e, "Probe failed");
            Outcome::ConnectionError
        }
        Ok(Err(PoolError::Connect(e))) => {
            tracing::warn!(backend = %backend.id(), error = %e, "Probe could not connect");
            Outcome::ConnectionError
        }
        // The pool is busy or closing; that says nothing about the backend.
        Ok(Err(e)) => {
            tracing::debug!(backend = %backend.id(), error = %e, "Probe skipped");
            return None;
        }
        Err(Deadline::Elapsed) => {
            tracing::warn!(backend = %backend.id(), timeout_ms = settings.timeout_ms, "Probe timed out");
            Outcome::Timeout
        }
        Err(Deadline::Cancelled) => return None,
    };

    backend.health.set_last_probe(if outcome.is_failure() {
        ProbeResult::Failed
    } else {
        ProbeResult::Ok
    });
    tracing::debug!(
        backend = %backend.id(),
        outcome = outcome.as_str(),
        trial = permit.is_trial(),
        "Probe completed"
    );
    permit.complete(outcome);
    Some(outcome)
}
