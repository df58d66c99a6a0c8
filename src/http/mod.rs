//! Inbound HTTP subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, middleware, request ID)
//!     → POST /rpc: parse JSON-RPC envelope
//!     → dispatcher (cache, ring, pool, backend)
//!     → JSON-RPC response body
//! ```
//!
//! Operator endpoints (`/health`, `/backends`, `/cache/flush`) read the
//! current generation and never block on reloads.

pub mod server;

pub use server::{AppState, HttpServer};
