//! Non-HTTP inbound fronts.
//!
//! # Data Flow
//! ```text
//! stdin (one JSON-RPC message per line)
//!     → stdio.rs (parse, spawn per request)
//!     → dispatcher
//!     → single writer task
//!     → stdout (one response per line)
//! ```

pub mod stdio;

pub use stdio::StdioFront;
