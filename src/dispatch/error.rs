//! Request-level error taxonomy.
//!
//! Every terminal failure a caller can see. Each variant knows its JSON-RPC
//! code, whether a retry on another backend may help, and which health
//! outcome (if any) it implies for the backend that produced it.

use serde_json::{json, Value};
use thiserror::Error;

use crate::health::Outcome;
use crate::load_balancer::{BackendId, PoolError, RingError};
use crate::protocol::jsonrpc::{
    JsonRpcError, BACKEND_TIMEOUT, BACKEND_UNAVAILABLE, NO_HEALTHY_BACKEND, POOL_EXHAUSTED,
    REQUEST_CANCELLED,
};

/// Cloneable so one coalesced outcome can be handed to every waiter.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no healthy backend available")]
    NoHealthyBackend,

    #[error("backend '{backend}' timed out")]
    BackendTimeout { backend: BackendId },

    #[error("backend '{backend}' returned error {code}: {message}")]
    BackendError {
        backend: BackendId,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("connection pool for '{backend}' exhausted")]
    PoolExhausted { backend: BackendId },

    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: BackendId, reason: String },

    #[error("request deadline exceeded")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Transient failures that may succeed on a different backend.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::BackendTimeout { .. }
                | DispatchError::PoolExhausted { .. }
                | DispatchError::BackendUnavailable { .. }
        )
    }

    /// Health outcome for the backend that produced this error.
    pub fn health_outcome(&self) -> Option<Outcome> {
        match self {
            DispatchError::BackendTimeout { .. } => Some(Outcome::Timeout),
            DispatchError::BackendUnavailable { .. } => Some(Outcome::ConnectionError),
            DispatchError::BackendError { .. } => Some(Outcome::BackendError),
            _ => None,
        }
    }

    pub fn backend(&self) -> Option<&BackendId> {
        match self {
            DispatchError::BackendTimeout { backend }
            | DispatchError::BackendError { backend, .. }
            | DispatchError::PoolExhausted { backend }
            | DispatchError::BackendUnavailable { backend, .. } => Some(backend),
            _ => None,
        }
    }

    /// Short label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::NoHealthyBackend => "no_healthy_backend",
            DispatchError::BackendTimeout { .. } => "backend_timeout",
            DispatchError::BackendError { .. } => "backend_error",
            DispatchError::PoolExhausted { .. } => "pool_exhausted",
            DispatchError::BackendUnavailable { .. } => "backend_unavailable",
            DispatchError::DeadlineExceeded => "deadline_exceeded",
            DispatchError::Cancelled => "cancelled",
        }
    }

    /// Error object sent back to the client.
    ///
    /// Backend errors pass through untouched; aggregator errors carry the
    /// backend (when known) and whether retrying later may help.
    pub fn to_jsonrpc(&self) -> JsonRpcError {
        let code = match self {
            DispatchError::BackendError { code, message, data, .. } => {
                let mut error = JsonRpcError::new(*code, message.clone());
                error.data = data.clone();
                return error;
            }
            DispatchError::InvalidRequest(detail) => return JsonRpcError::invalid_request(detail.clone()),
            DispatchError::NoHealthyBackend => NO_HEALTHY_BACKEND,
            DispatchError::BackendTimeout { .. } | DispatchError::DeadlineExceeded => BACKEND_TIMEOUT,
            DispatchError::PoolExhausted { .. } => POOL_EXHAUSTED,
            DispatchError::BackendUnavailable { .. } => BACKEND_UNAVAILABLE,
            DispatchError::Cancelled => REQUEST_CANCELLED,
        };

        let mut data = json!({
            "kind": self.label(),
            "retryable": !matches!(self, DispatchError::Cancelled),
        });
        if let Some(backend) = self.backend() {
            data["backend"] = json!(backend.as_str());
        }
        JsonRpcError::new(code, self.to_string()).with_data(data)
    }

    /// Classify a pool failure for `backend`.
    pub fn from_pool(backend: &BackendId, error: PoolError) -> Self {
        match error {
            PoolError::Exhausted { .. } => DispatchError::PoolExhausted { backend: backend.clone() },
            PoolError::Cancelled => DispatchError::Cancelled,
            PoolError::Connect(e) => DispatchError::BackendUnavailable {
                backend: backend.clone(),
                reason: e.to_string(),
            },
            PoolError::Closed => DispatchError::BackendUnavailable {
                backend: backend.clone(),
                reason: "pool closed".into(),
            },
        }
    }

    pub fn from_backend(backend: &BackendId, error: JsonRpcError) -> Self {
        DispatchError::BackendError {
            backend: backend.clone(),
            code: error.code,
            message: error.message,
            data: error.data,
        }
    }
}

impl From<RingError> for DispatchError {
    fn from(_: RingError) -> Self {
        DispatchError::NoHealthyBackend
    }
}
