//! Request dispatch subsystem.
//!
//! # Data Flow
//! ```text
//! JsonRpcRequest
//!     → dispatcher.rs (normalize, pin generation, ring lookup)
//!     → cache (hit | coalesced wait | compute)
//!     → live path: health admission → pool acquire → transport send
//!     → outcome reported to health, connection released
//!     → error.rs maps failures to JSON-RPC error objects
//! ```

pub mod dispatcher;
pub mod error;

pub use dispatcher::Dispatcher;
pub use error::DispatchError;
