//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (bound the call by deadline and cancellation)
//!     → On failure: retries.rs (transient? pick another backend after backoff.rs)
//!     → health (breaker bookkeeping lives with the backend's health record)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every backend call has a deadline
//! - Retries move to a different backend, never hammer the same one
//! - Jittered backoff prevents thundering herd

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use backoff::calculate_backoff;
pub use retries::{is_transient, RetryPolicy};
pub use timeouts::{with_deadline, Deadline};
