//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Load config → Validate → Build generation 1 → Spawn background tasks → Start front
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Stop accepting → Drain generations → Close pools → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Reload the config file
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then the front
//! - Ordered shutdown: stop accept, drain, close
//! - Drain is bounded by `reload.drain_grace_secs`

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{wait_for_signal, SignalEvent};
pub use startup::{start, StartupError};
