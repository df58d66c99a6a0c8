//! Hot reload subsystem.
//!
//! # Data Flow
//! ```text
//! new AggregatorConfig (watcher, SIGHUP, CLI edit)
//!     → manager.rs validates
//!     → generation.rs builds registry + ring + pools off to the side
//!     → ArcSwap store (single pointer swap)
//!     → previous generation drains, its pools close, stale cache entries go
//! ```
//!
//! # Design Decisions
//! - A request pins one generation for its whole lifetime
//! - Registry, ring and pools always come from the same generation

pub mod generation;
pub mod manager;

pub use generation::{ConfigGeneration, GenerationGuard};
pub use manager::{ReloadError, ReloadManager};
