//! Aggregating JSON-RPC proxy for MCP tool servers.

// Core request path
pub mod cache;
pub mod dispatch;
pub mod load_balancer;
pub mod protocol;
pub mod transport;

// Fronts
pub mod http;
pub mod net;

// Control plane
pub mod config;
pub mod health;
pub mod reload;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::AggregatorConfig;
pub use dispatch::{DispatchError, Dispatcher};
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use reload::ReloadManager;
