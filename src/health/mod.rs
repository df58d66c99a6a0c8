//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Periodic timer
//!     → Probe each backend through its pool
//!     → passive.rs records the outcome
//!
//! Passive health checks (passive.rs):
//!     Dispatcher reports a classified outcome
//!     → state.rs counts the failure streak
//!     → Closed → Open once the threshold is reached
//!
//! State machine (state.rs):
//!     Closed → Open → HalfOpen → Closed | Open
//!     Cooldown grows on every failed trial
//! ```
//!
//! # Design Decisions
//! - Active and passive checks feed one breaker per backend
//! - Health state is per-backend, lock-free, and survives reloads
//! - Routing reads state without ever waiting on a transition

pub mod active;
pub mod passive;
pub mod state;

pub use active::ActiveProber;
pub use passive::{HealthMonitor, Outcome, Permit};
pub use state::{CircuitState, HealthRecord, HealthSnapshot, ProbeResult};
