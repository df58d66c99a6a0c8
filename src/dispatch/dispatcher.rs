//! Request dispatcher.
//!
//! # Responsibilities
//! - Normalize an inbound request and pin the current generation
//! - Pick the preferred backend from the ring and derive the cache key
//! - Serve from cache, join an identical in-flight request, or run the
//!   live path: admit → acquire → forward → classify → report → release
//! - Retry transient failures on a different backend with backoff
//!
//! # Design Decisions
//! - One cancellation token covers cache wait, pool acquire and backend call
//! - Breaker rejections reselect without consuming an attempt
//! - Outbound requests get a fresh id; the caller's id is restored on reply

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKey, CacheLayer};
use crate::dispatch::error::DispatchError;
use crate::health::{Outcome, Permit};
use crate::load_balancer::{BackendId, PoolError};
use crate::observability::metrics;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse, NormalizedRequest, JSONRPC_VERSION};
use crate::reload::{ConfigGeneration, ReloadManager};
use crate::resilience::{with_deadline, Deadline, RetryPolicy};
use crate::transport::next_outbound_id;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    manager: Arc<ReloadManager>,
    cache: Arc<CacheLayer>,
}

impl Dispatcher {
    pub fn new(manager: Arc<ReloadManager>) -> Self {
        let cache = manager.cache().clone();
        Self { manager, cache }
    }

    pub fn manager(&self) -> &Arc<ReloadManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<CacheLayer> {
        &self.cache
    }

    /// Handle one inbound message. Notifications produce no response.
    pub async fn handle(&self, request: JsonRpcRequest, cancel: &CancellationToken) -> Option<JsonRpcResponse> {
        let id = request.id.clone().unwrap_or(Value::Null);

        if request.jsonrpc != JSONRPC_VERSION {
            let error = DispatchError::InvalidRequest(format!("unsupported jsonrpc version '{}'", request.jsonrpc));
            return Some(JsonRpcResponse::failure(id, error.to_jsonrpc()));
        }
        if request.is_notification() {
            tracing::debug!(method = %request.method, "Notification accepted, not forwarded");
            return None;
        }

        let deadline = self.manager.current().config().timeouts.request();
        let result = match with_deadline(deadline, cancel, self.dispatch(&request, cancel)).await {
            Ok(result) => result,
            Err(Deadline::Elapsed) => Err(DispatchError::DeadlineExceeded),
            Err(Deadline::Cancelled) => Err(DispatchError::Cancelled),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(error) => {
                tracing::debug!(method = %request.method, error = %error, "Request failed");
                JsonRpcResponse::failure(id, error.to_jsonrpc())
            }
        })
    }

    /// Route one request and return its result payload.
    pub async fn dispatch(&self, request: &JsonRpcRequest, cancel: &CancellationToken) -> Result<Value, DispatchError> {
        let started = Instant::now();
        let normalized = NormalizedRequest::new(request);
        if normalized.method().is_empty() {
            return Err(DispatchError::InvalidRequest("method must not be empty".into()));
        }

        let generation = self.manager.enter();
        let routing_key = normalized.routing_key();

        let preferred = match generation
            .ring()
            .lookup(routing_key.as_bytes(), |id| is_available(&generation, id))
        {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(method = %normalized.method(), generation = generation.version(), "No healthy backend");
                metrics::record_request(normalized.method(), "no_healthy_backend", "none", started.elapsed());
                return Err(e.into());
            }
        };

        let Some(backend) = generation.registry().get(&preferred) else {
            return Err(DispatchError::NoHealthyBackend);
        };
        let key = CacheKey::new(&normalized, &preferred, backend.fingerprint());
        let store = self.cache.is_cacheable(normalized.method());
        // Once a reload swapped this generation out, its results may come from
        // an endpoint the new configuration no longer points at.
        let still_current = || self.manager.is_current(&generation);
        let result = self
            .cache
            .get_or_compute_while(key, &preferred, store, still_current, cancel, || {
                self.live(&generation, request, &routing_key, preferred.clone(), cancel)
            })
            .await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.label(),
        };
        metrics::record_request(normalized.method(), outcome, preferred.as_str(), started.elapsed());
        tracing::debug!(
            method = %normalized.method(),
            backend = %preferred,
            generation = generation.version(),
            outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Request dispatched"
        );

        result.map(Arc::unwrap_or_clone)
    }

    async fn live(
        &self,
        generation: &ConfigGeneration,
        request: &JsonRpcRequest,
        routing_key: &str,
        preferred: BackendId,
        cancel: &CancellationToken,
    ) -> Result<Value, DispatchError> {
        let policy = RetryPolicy::from(&generation.config().retries);
        let call_timeout = generation.config().timeouts.backend_call();

        let mut excluded: HashSet<BackendId> = HashSet::new();
        let mut next = Some(preferred);
        let mut attempt = 0u32;
        let mut last_error: Option<DispatchError> = None;

        loop {
            let id = match next.take() {
                Some(id) => id,
                None => match generation.ring().lookup_excluding(routing_key.as_bytes(), &excluded, |id| {
                    is_available(generation, id)
                }) {
                    Ok(id) => id,
                    Err(e) => return Err(last_error.unwrap_or_else(|| e.into())),
                },
            };

            let Some(backend) = generation.registry().get(&id) else {
                excluded.insert(id);
                continue;
            };
            let Some(permit) = generation.monitor().admit(backend) else {
                tracing::debug!(backend = %id, "Circuit rejected admission, reselecting");
                excluded.insert(id);
                continue;
            };

            attempt += 1;
            let error = match forward(generation, permit, request, call_timeout, cancel).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !policy.should_retry(attempt, &error) {
                return Err(error);
            }
            let delay = policy.delay(attempt);
            tracing::warn!(
                backend = %id,
                attempt,
                max_attempts = policy.max_attempts,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "Transient backend failure, retrying on another backend"
            );
            excluded.insert(id);
            last_error = Some(error);

            tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn is_available(generation: &ConfigGeneration, id: &BackendId) -> bool {
    generation
        .registry()
        .get(id)
        .is_some_and(|backend| backend.health.is_available())
}

/// One attempt against the permit's backend.
async fn forward(
    generation: &ConfigGeneration,
    permit: Permit,
    request: &JsonRpcRequest,
    call_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Value, DispatchError> {
    let backend = permit.backend().clone();
    let id = backend.id();

    let Some(pool) = generation.pools().get(id) else {
        return Err(DispatchError::BackendUnavailable {
            backend: id.clone(),
            reason: "no connection pool".into(),
        });
    };

    let mut conn = match pool.acquire(cancel).await {
        Ok(conn) => conn,
        Err(e) => {
            // Only a failed connect says something about the backend itself.
            if matches!(e, PoolError::Connect(_)) {
                permit.complete(Outcome::ConnectionError);
            }
            return Err(DispatchError::from_pool(id, e));
        }
    };

    let outbound = request.with_id(next_outbound_id());
    let sent = with_deadline(call_timeout, cancel, conn.send(&outbound)).await;

    let (outcome, result) = match sent {
        Ok(Ok(response)) => match response.into_result() {
            Ok(value) => (Outcome::Success, Ok(value)),
            Err(error) => (Outcome::BackendError, Err(DispatchError::from_backend(id, error))),
        },
        Ok(Err(e)) => {
            conn.mark_broken();
            let error = DispatchError::BackendUnavailable {
                backend: id.clone(),
                reason: e.to_string(),
            };
            (Outcome::ConnectionError, Err(error))
        }
        Err(Deadline::Elapsed) => {
            // A late reply must not be read by the next request.
            conn.mark_broken();
            (Outcome::Timeout, Err(DispatchError::BackendTimeout { backend: id.clone() }))
        }
        Err(Deadline::Cancelled) => {
            conn.mark_broken();
            return Err(DispatchError::Cancelled);
        }
    };

    drop(conn);
    permit.complete(outcome);
    result
}
