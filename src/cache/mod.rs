//! Response cache subsystem.
//!
//! # Data Flow
//! ```text
//! CacheKey (normalized method + params + backend id + descriptor fingerprint)
//!     → exact.rs (sharded LRU, byte budget, TTL, shared bodies)
//!     → content.rs (key → digest → shared blob)
//!         → promoted back into exact.rs after repeated hits
//!     → coalesce.rs (join an in-flight computation or lead one)
//!     → compute (the dispatcher's live path)
//! ```
//!
//! # Design Decisions
//! - Errors pass through unchanged and are never stored
//! - Shard locks are short and never held across an await
//! - Coalescing leadership is taken before any pool acquire

pub mod coalesce;
pub mod content;
pub mod exact;
pub mod key;
pub mod layer;

pub use key::CacheKey;
pub use layer::{CacheLayer, CacheStats};
