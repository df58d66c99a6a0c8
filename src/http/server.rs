//! Inbound HTTP front.
//!
//! # Responsibilities
//! - Create the Axum router with the JSON-RPC and operator endpoints
//! - Wire up middleware (tracing, timeout, body limit, request ID)
//! - Hand each JSON-RPC request to the dispatcher under its own cancel token
//! - Apply configuration updates coming from the watcher
//!
//! # Design Decisions
//! - A client disconnect drops the handler future; the token's drop guard
//!   then cancels backend calls, pool waits and cache waits for that request
//! - Transport-level problems (bad JSON, oversize body) still answer with a
//!   JSON-RPC error body where one can be produced

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, State},
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::cache::CacheStats;
use crate::config::{AggregatorConfig, TransportKind};
use crate::dispatch::Dispatcher;
use crate::health::HealthSnapshot;
use crate::load_balancer::{BackendId, PoolStats};
use crate::protocol::parse_message;

/// Headroom on top of the dispatcher's own deadline, so the dispatcher gets
/// to answer with a structured timeout error before the layer cuts in.
const TIMEOUT_HEADROOM: Duration = Duration::from_secs(1);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
}

/// HTTP server for the aggregator.
pub struct HttpServer {
    router: Router,
    dispatcher: Dispatcher,
}

impl HttpServer {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let config = dispatcher.manager().current().config().clone();
        let state = AppState {
            dispatcher: dispatcher.clone(),
        };
        let router = Self::build_router(&config, state);
        Self { router, dispatcher }
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// Layer settings come from the configuration at startup; a reload
    /// changes routing, not the listener.
    #[allow(deprecated)]
    fn build_router(config: &AggregatorConfig, state: AppState) -> Router {
        Router::new()
            .route("/rpc", post(rpc_handler))
            .route("/health", get(health_handler))
            .route("/backends", get(backends_handler))
            .route("/cache/flush", post(flush_handler))
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(TimeoutLayer::new(config.timeouts.request() + TIMEOUT_HEADROOM))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id = %request_id,
                )
            }))
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
    }

    /// Run the server, accepting connections on the given listener.
    ///
    /// Configuration updates received on `config_updates` are applied for as
    /// long as the server runs.
    pub async fn run(
        self,
        listener: TcpListener,
        config_updates: mpsc::UnboundedReceiver<AggregatorConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let stop_reloads = CancellationToken::new();
        let reloads = tokio::spawn(
            self.dispatcher
                .manager()
                .clone()
                .follow(config_updates, stop_reloads.clone()),
        );

        let served = axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server received shutdown signal");
            })
            .await;

        // Let an in-progress reload finish so its old generation is drained.
        stop_reloads.cancel();
        if let Err(e) = reloads.await {
            tracing::error!(error = %e, "Config update task failed");
        }
        served?;
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// JSON-RPC endpoint.
async fn rpc_handler(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_message(&body) {
        Ok(request) => request,
        Err(response) => {
            tracing::debug!("Rejected malformed JSON-RPC message");
            return Json(response).into_response();
        }
    };

    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    match state.dispatcher.handle(request, &cancel).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let generation = state.dispatcher.manager().current();
    let healthy = generation
        .registry()
        .iter()
        .filter(|backend| backend.health.is_available())
        .count();

    Json(json!({
        "status": "ok",
        "generation": generation.version(),
        "backends": generation.registry().len(),
        "healthy": healthy,
        "in_flight": generation.in_flight(),
        "cache": state.dispatcher.cache().stats(),
    }))
}

#[derive(Debug, Serialize)]
struct BackendView {
    id: BackendId,
    transport: TransportKind,
    endpoint: String,
    weight: u32,
    health: HealthSnapshot,
    pool: Option<PoolStats>,
}

async fn backends_handler(State(state): State<AppState>) -> impl IntoResponse {
    let generation = state.dispatcher.manager().current();
    let backends: Vec<BackendView> = generation
        .registry()
        .iter()
        .map(|backend| BackendView {
            id: backend.id().clone(),
            transport: backend.descriptor.transport,
            endpoint: backend.descriptor.endpoint.clone(),
            weight: backend.descriptor.weight,
            health: backend.health.snapshot(),
            pool: generation.pools().get(backend.id()).map(|pool| pool.stats()),
        })
        .collect();

    Json(json!({
        "generation": generation.version(),
        "backends": backends,
    }))
}

async fn flush_handler(State(state): State<AppState>) -> Json<CacheStats> {
    let cache = state.dispatcher.cache();
    cache.flush();
    tracing::info!("Cache flushed by operator");
    Json(cache.stats())
}
