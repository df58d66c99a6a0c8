//! Inbound/outbound protocol subsystem.
//!
//! # Data Flow
//! ```text
//! raw JSON (HTTP body or stdio line)
//!     → jsonrpc.rs (envelope types, error codes)
//!     → normalize.rs (canonical form for routing and cache keys)
//!     → dispatcher
//! ```

pub mod jsonrpc;
pub mod normalize;

pub use jsonrpc::{parse_message, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
pub use normalize::NormalizedRequest;
