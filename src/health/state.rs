//! Backend circuit breaker state machine.
//!
//! # States
//! - Closed: backend receives traffic
//! - Open: backend rejected fast until the cooldown elapses
//! - HalfOpen: exactly one trial request in flight
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures within the window >= failure_threshold
//! Open → HalfOpen: first admission after the cooldown
//! HalfOpen → Closed: the trial succeeds (counters reset)
//! HalfOpen → Open: the trial fails (cooldown grows by backoff_multiplier)
//! ```
//!
//! While HalfOpen only the trial's outcome counts. Calls admitted earlier,
//! while the circuit was still Closed, may finish late and are ignored.
//!
//! # Design Decisions
//! - All fields are atomics; a record is only ever touched for its own backend
//! - Reads never wait for a transition
//! - Time is measured from a per-record epoch on the tokio clock

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;

/// Circuit state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Result of the most recent active probe.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResult {
    Unknown = 0,
    Ok = 1,
    Failed = 2,
}

impl From<u8> for ProbeResult {
    fn from(val: u8) -> Self {
        match val {
            1 => ProbeResult::Ok,
            2 => ProbeResult::Failed,
            _ => ProbeResult::Unknown,
        }
    }
}

/// Outcome of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; ordinary request.
    Normal,
    /// The single half-open trial. `transitioned` is set when this
    /// admission moved the circuit from Open to HalfOpen.
    Trial { transitioned: bool },
    /// Circuit open (or trial already taken).
    Rejected,
}

/// Point-in-time view for listings.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub ms_since_transition: u64,
    pub last_probe: ProbeResult,
}

/// Per-backend health record.
#[derive(Debug)]
pub struct HealthRecord {
    epoch: Instant,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    streak_started_ms: AtomicU64,
    opened_at_ms: AtomicU64,
    cooldown_ms: AtomicU64,
    consecutive_opens: AtomicU32,
    trial_in_flight: AtomicBool,
    last_transition_ms: AtomicU64,
    last_probe: AtomicU8,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRecord {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            streak_started_ms: AtomicU64::new(0),
            opened_at_ms: AtomicU64::new(0),
            cooldown_ms: AtomicU64::new(0),
            consecutive_opens: AtomicU32::new(0),
            trial_in_flight: AtomicBool::new(false),
            last_transition_ms: AtomicU64::new(0),
            last_probe: AtomicU8::new(ProbeResult::Unknown as u8),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_probe(&self) -> ProbeResult {
        ProbeResult::from(self.last_probe.load(Ordering::Relaxed))
    }

    pub fn set_last_probe(&self, result: ProbeResult) {
        self.last_probe.store(result as u8, Ordering::Relaxed);
    }

    fn cooldown_elapsed(&self, now: u64) -> bool {
        let opened = self.opened_at_ms.load(Ordering::Acquire);
        now.saturating_sub(opened) >= self.cooldown_ms.load(Ordering::Acquire)
    }

    /// Non-blocking routing check used by the ring's health filter.
    ///
    /// An Open circuit whose cooldown has elapsed counts as available: the
    /// next admission turns it into the half-open trial.
    pub fn is_available(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => self.cooldown_elapsed(self.now_ms()),
            CircuitState::HalfOpen => !self.trial_in_flight.load(Ordering::Acquire),
        }
    }

    /// Ask to send one request to this backend.
    pub fn try_admit(&self) -> Admission {
        loop {
            match self.state() {
                CircuitState::Closed => return Admission::Normal,
                CircuitState::Open => {
                    if !self.cooldown_elapsed(self.now_ms()) {
                        return Admission::Rejected;
                    }
                    // Claim the trial before publishing HalfOpen so no other
                    // caller can observe HalfOpen with a free trial slot.
                    if self
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        return Admission::Rejected;
                    }
                    if self.transition(CircuitState::Open, CircuitState::HalfOpen) {
                        return Admission::Trial { transitioned: true };
                    }
                    self.trial_in_flight.store(false, Ordering::Release);
                }
                CircuitState::HalfOpen => {
                    return match self.trial_in_flight.compare_exchange(
                        false,
                        true,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => Admission::Trial { transitioned: false },
                        Err(_) => Admission::Rejected,
                    };
                }
            }
        }
    }

    /// Give back a trial slot whose request ended without an outcome.
    pub fn release_trial(&self) {
        self.trial_in_flight.store(false, Ordering::Release);
    }

    /// Record a successful call. `trial` tells whether the call held the
    /// half-open trial slot. Returns the new state on a transition.
    pub fn record_success(&self, trial: bool) -> Option<CircuitState> {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                None
            }
            CircuitState::HalfOpen if !trial => None,
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.consecutive_opens.store(0, Ordering::Relaxed);
                    self.trial_in_flight.store(false, Ordering::Release);
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            // Late result of a call admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    /// Record a failed call. `trial` as for [`HealthRecord::record_success`].
    /// Returns the new state on a transition.
    pub fn record_failure(&self, config: &CircuitBreakerConfig, trial: bool) -> Option<CircuitState> {
        let now = self.now_ms();
        match self.state() {
            CircuitState::Closed => {
                let window = config.failure_window_ms;
                let streak_start = self.streak_started_ms.load(Ordering::Relaxed);
                let count = if self.consecutive_failures.load(Ordering::Relaxed) == 0
                    || now.saturating_sub(streak_start) > window
                {
                    self.streak_started_ms.store(now, Ordering::Relaxed);
                    self.consecutive_failures.store(1, Ordering::Relaxed);
                    1
                } else {
                    self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
                };

                if count >= config.failure_threshold && self.transition(CircuitState::Closed, CircuitState::Open) {
                    self.open(config, now, 1);
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::HalfOpen if !trial => None,
            CircuitState::HalfOpen => {
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    let opens = self.consecutive_opens.load(Ordering::Relaxed).saturating_add(1);
                    self.open(config, now, opens);
                    self.trial_in_flight.store(false, Ordering::Release);
                    return Some(CircuitState::Open);
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    fn open(&self, config: &CircuitBreakerConfig, now: u64, opens: u32) {
        let growth = config.backoff_multiplier.max(1.0).powi(opens.saturating_sub(1) as i32);
        let cooldown = (config.cooldown_ms as f64 * growth).min(config.max_cooldown_ms.max(config.cooldown_ms) as f64);
        self.cooldown_ms.store(cooldown as u64, Ordering::Release);
        self.opened_at_ms.store(now, Ordering::Release);
        self.consecutive_opens.store(opens, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.last_transition_ms.store(self.now_ms(), Ordering::Relaxed);
        }
        swapped
    }

    /// Current cooldown length in milliseconds (0 until the first open).
    pub fn cooldown_ms(&self) -> u64 {
        self.cooldown_ms.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            ms_since_transition: self
                .now_ms()
                .saturating_sub(self.last_transition_ms.load(Ordering::Relaxed)),
            last_probe: self.last_probe(),
        }
    }
}
