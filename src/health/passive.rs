//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Admit requests through the circuit breaker
//! - Observe request outcomes reported by the dispatcher
//! - Trigger state transitions and report them
//!
//! # Design Decisions
//! - Backend errors, timeouts and connection errors are failures
//! - Pool exhaustion is not a backend failure (the proxy is the bottleneck)
//! - A trial permit dropped without an outcome frees the trial slot
//! - Only the trial permit's outcome moves a half-open circuit

use std::sync::Arc;

use crate::config::CircuitBreakerConfig;
use crate::health::state::{Admission, CircuitState, HealthRecord};
use crate::load_balancer::backend::Backend;
use crate::observability::metrics;

/// Classified result of one forwarded call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// Protocol-level error object from the backend.
    BackendError,
    Timeout,
    ConnectionError,
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Success)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::BackendError => "backend_error",
            Outcome::Timeout => "timeout",
            Outcome::ConnectionError => "connection_error",
        }
    }
}

/// Owner of every state change on backend health records.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    config: Arc<CircuitBreakerConfig>,
}

impl HealthMonitor {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Ask the breaker for permission to call `backend`.
    pub fn admit(&self, backend: &Arc<Backend>) -> Option<Permit> {
        match backend.health.try_admit() {
            Admission::Rejected => None,
            Admission::Normal => Some(Permit::new(self.clone(), backend.clone(), false)),
            Admission::Trial { transitioned } => {
                if transitioned {
                    self.report_transition(backend, CircuitState::HalfOpen);
                }
                Some(Permit::new(self.clone(), backend.clone(), true))
            }
        }
    }

    /// Record an outcome for an ordinary (non-trial) call.
    pub fn record(&self, backend: &Backend, outcome: Outcome) {
        self.settle(backend, false, outcome);
    }

    fn settle(&self, backend: &Backend, trial: bool, outcome: Outcome) {
        let transition = if outcome.is_failure() {
            backend.health.record_failure(&self.config, trial)
        } else {
            backend.health.record_success(trial)
        };
        if let Some(state) = transition {
            self.report_transition(backend, state);
        }
    }

    fn report_transition(&self, backend: &Backend, state: CircuitState) {
        match state {
            CircuitState::Open => tracing::warn!(
                backend = %backend.id(),
                cooldown_ms = backend.health.cooldown_ms(),
                "Circuit opened"
            ),
            CircuitState::HalfOpen => tracing::info!(backend = %backend.id(), "Circuit half-open, admitting trial"),
            CircuitState::Closed => tracing::info!(backend = %backend.id(), "Circuit closed"),
        }
        metrics::record_circuit_transition(backend.id().as_str(), state);
    }
}

/// Permission to send one request to a backend.
///
/// Consumed by [`Permit::complete`]; dropping it instead means the request
/// ended without an outcome (cancelled), which frees a half-open trial.
#[derive(Debug)]
pub struct Permit {
    monitor: HealthMonitor,
    backend: Arc<Backend>,
    trial: bool,
    completed: bool,
}

impl Permit {
    fn new(monitor: HealthMonitor, backend: Arc<Backend>, trial: bool) -> Self {
        Self {
            monitor,
            backend,
            trial,
            completed: false,
        }
    }

    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn complete(mut self, outcome: Outcome) {
        self.completed = true;
        self.monitor.settle(&self.backend, self.trial, outcome);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.completed && self.trial {
            tracing::debug!(backend = %self.backend.id(), "Trial abandoned, releasing slot");
            self.backend.health.release_trial();
        }
    }
}
