//! Backend transport subsystem.
//!
//! # Data Flow
//! ```text
//! pool.rs asks for a new connection
//!     → Connection::establish (spawn / connect / open stream)
//!     → optional initialize handshake
//!     → Connection::send (one request, one matching response)
//! ```
//!
//! # Design Decisions
//! - Closed set of transports as one enum; no trait objects
//! - Responses are matched by id; unrelated lines, frames and events are skipped
//! - Every transport error is a connection-level failure to the dispatcher

pub mod http;
pub mod pipe;
pub mod sse;
pub mod websocket;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;

use crate::config::TransportKind;
use crate::load_balancer::backend::BackendDescriptor;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

pub use self::http::HttpConnection;
pub use self::pipe::PipeConnection;
pub use self::sse::SseConnection;
pub use self::websocket::WsConnection;

/// Protocol revision announced in the connection handshake.
pub const HANDSHAKE_PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on a single buffered response body.
pub(crate) const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;

static OUTBOUND_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for an outbound request.
pub fn next_outbound_id() -> u64 {
    OUTBOUND_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Errors raised while talking to a backend.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("backend returned HTTP {0}")]
    Status(u16),

    #[error("connection closed by backend")]
    Closed,
}

/// A live connection to one backend.
#[derive(Debug)]
pub enum Connection {
    Pipe(PipeConnection),
    Http(HttpConnection),
    Sse(SseConnection),
    WebSocket(WsConnection),
}

impl Connection {
    /// Open a connection and, if the backend asks for it, run the handshake.
    pub async fn establish(
        descriptor: &BackendDescriptor,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let connect = async {
            let mut conn = match descriptor.transport {
                TransportKind::Stdio => Connection::Pipe(PipeConnection::spawn(descriptor)?),
                TransportKind::Http => Connection::Http(HttpConnection::new(descriptor)?),
                TransportKind::Sse => Connection::Sse(SseConnection::connect(descriptor).await?),
                TransportKind::Websocket => {
                    Connection::WebSocket(WsConnection::connect(descriptor).await?)
                }
            };
            if descriptor.handshake {
                conn.handshake().await?;
            }
            Ok(conn)
        };

        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Connect(format!(
                "timed out after {}ms",
                connect_timeout.as_millis()
            ))),
        }
    }

    /// Send one request and wait for its response.
    pub async fn send(&mut self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, TransportError> {
        let id = request
            .id
            .clone()
            .ok_or_else(|| TransportError::Protocol("request without id".into()))?;
        match self {
            Connection::Pipe(c) => c.send(request, &id).await,
            Connection::Http(c) => c.send(request, &id).await,
            Connection::Sse(c) => c.send(request, &id).await,
            Connection::WebSocket(c) => c.send(request, &id).await,
        }
    }

    /// Send a notification; no response is expected.
    pub async fn notify(&mut self, notification: &JsonRpcRequest) -> Result<(), TransportError> {
        match self {
            Connection::Pipe(c) => c.notify(notification).await,
            Connection::Http(c) => c.notify(notification).await,
            Connection::Sse(c) => c.notify(notification).await,
            Connection::WebSocket(c) => c.notify(notification).await,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        match self {
            Connection::Pipe(c) => c.is_alive(),
            Connection::Http(_) => true,
            Connection::Sse(c) => c.is_alive(),
            Connection::WebSocket(c) => c.is_alive(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Connection::Pipe(_) => TransportKind::Stdio,
            Connection::Http(_) => TransportKind::Http,
            Connection::Sse(_) => TransportKind::Sse,
            Connection::WebSocket(_) => TransportKind::Websocket,
        }
    }

    async fn handshake(&mut self) -> Result<(), TransportError> {
        let init = JsonRpcRequest::new(
            next_outbound_id(),
            "initialize",
            Some(json!({
                "protocolVersion": HANDSHAKE_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            })),
        );
        let response = self.send(&init).await?;
        if let Some(error) = response.error {
            return Err(TransportError::Protocol(format!("initialize rejected: {}", error)));
        }
        self.notify(&JsonRpcRequest::notification("notifications/initialized", None))
            .await
    }
}

/// Parse `text` as the response to request `id`.
///
/// Returns `Ok(None)` for anything else the backend may interleave: log
/// lines, notifications, server-initiated requests, stale responses.
pub(crate) fn match_response(text: &str, id: &Value) -> Option<JsonRpcResponse> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    if value.get("id") != Some(id) {
        return None;
    }
    if value.get("result").is_none() && value.get("error").is_none() {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_response_skips_noise() {
        let id = json!(7);
        assert!(match_response("starting server...", &id).is_none());
        assert!(match_response(r#"{"jsonrpc":"2.0","method":"notifications/progress"}"#, &id).is_none());
        assert!(match_response(r#"{"jsonrpc":"2.0","id":6,"result":{}}"#, &id).is_none());
        assert!(match_response(r#"{"jsonrpc":"2.0","id":7,"method":"sampling/create"}"#, &id).is_none());

        let resp = match_response(r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#, &id).unwrap();
        assert_eq!(resp.result, Some(json!({"ok": true})));
    }

    #[test]
    fn test_outbound_ids_are_unique() {
        let a = next_outbound_id();
        let b = next_outbound_id();
        assert_ne!(a, b);
    }
}
