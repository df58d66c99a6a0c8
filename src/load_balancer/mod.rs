//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Normalized request
//!     → ring.rs (routing key → preferred backend, health filtered)
//!     → registry.rs (backend id → descriptor + health record)
//!     → pool.rs (check out a connection to that backend)
//!     → connection returned to the pool on drop
//! ```
//!
//! # Design Decisions
//! - Registry, ring and pools are rebuilt per generation, never mutated in place
//! - Health records outlive generations while a backend's descriptor is unchanged
//! - Unhealthy backends are skipped by the ring, not removed from it

pub mod backend;
pub mod pool;
pub mod registry;
pub mod ring;

pub use backend::{Backend, BackendDescriptor, BackendId, Fingerprint};
pub use pool::{ConnectionPool, PoolError, PoolSet, PoolStats, PooledConnection};
pub use registry::{BackendRegistry, RegistryDiff};
pub use ring::{HashRing, RingError};
