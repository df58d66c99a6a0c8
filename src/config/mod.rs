//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → AggregatorConfig (validated, immutable)
//!     → handed to the reload manager
//!
//! On change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → reload manager builds and swaps a new generation
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, save_config, ConfigError};
pub use schema::{
    AggregatorConfig, BackendConfig, CacheConfig, CircuitBreakerConfig, HealthCheckConfig,
    ListenerConfig, ObservabilityConfig, PoolConfig, ReloadConfig, RetryConfig, RingConfig,
    TimeoutConfig, TransportKind,
};
pub use validation::{validate_config, ValidationError};
