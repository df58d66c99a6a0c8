//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use mcp_aggregator::cache::CacheLayer;
use mcp_aggregator::config::{AggregatorConfig, BackendConfig, TransportKind};
use mcp_aggregator::{Dispatcher, ReloadManager};

/// A mock JSON-RPC backend listening on an ephemeral port.
#[derive(Clone)]
pub struct MockBackend {
    pub name: String,
    pub addr: SocketAddr,
    calls: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
}

impl MockBackend {
    pub fn endpoint(&self) -> String {
        format!("http://{}/rpc", self.addr)
    }

    /// Requests received, probes excluded.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> BackendConfig {
        BackendConfig {
            id: self.name.clone(),
            transport: TransportKind::Http,
            endpoint: self.endpoint(),
            args: Vec::new(),
            env: Default::default(),
            weight: 1,
            handshake: false,
        }
    }
}

type Handler = Arc<dyn Fn(Value) -> std::pin::Pin<Box<dyn Future<Output = (StatusCode, Value)> + Send>> + Send + Sync>;

#[derive(Clone)]
struct BackendState {
    calls: Arc<AtomicUsize>,
    probes: Arc<AtomicUsize>,
    handler: Handler,
}

async fn rpc(State(state): State<BackendState>, Json(request): Json<Value>) -> (StatusCode, Json<Value>) {
    if request["method"] == json!("ping") {
        state.probes.fetch_add(1, Ordering::SeqCst);
    } else {
        state.calls.fetch_add(1, Ordering::SeqCst);
    }
    let (status, body) = (state.handler)(request).await;
    (status, Json(body))
}

/// Start a programmable backend. `f` gets the raw request and returns the
/// HTTP status and body to answer with.
pub async fn start_programmable_backend<F, Fut>(name: &str, f: F) -> MockBackend
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (StatusCode, Value)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handler: Handler = Arc::new(move |request| Box::pin(f(request)));
    let state = BackendState {
        calls: Arc::new(AtomicUsize::new(0)),
        probes: Arc::new(AtomicUsize::new(0)),
        handler,
    };
    let backend = MockBackend {
        name: name.to_string(),
        addr,
        calls: state.calls.clone(),
        probes: state.probes.clone(),
    };

    let app = Router::new().route("/rpc", post(rpc)).with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    backend
}

fn echo(name: &str, request: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {
            "backend": name,
            "method": request["method"],
            "params": request.get("params").cloned().unwrap_or(Value::Null),
        }
    })
}

/// Backend that answers every request with its own name and the request.
pub async fn start_echo_backend(name: &str) -> MockBackend {
    let owned = name.to_string();
    start_programmable_backend(name, move |request| {
        let body = echo(&owned, &request);
        async move { (StatusCode::OK, body) }
    })
    .await
}

/// Backend that answers after `delay`.
pub async fn start_slow_backend(name: &str, delay: Duration) -> MockBackend {
    let owned = name.to_string();
    start_programmable_backend(name, move |request| {
        let body = echo(&owned, &request);
        async move {
            tokio::time::sleep(delay).await;
            (StatusCode::OK, body)
        }
    })
    .await
}

/// Backend that answers HTTP 500 while `failing` is set, echoes otherwise.
pub async fn start_flaky_backend(name: &str, failing: Arc<AtomicBool>) -> MockBackend {
    let owned = name.to_string();
    start_programmable_backend(name, move |request| {
        let body = if failing.load(Ordering::SeqCst) {
            None
        } else {
            Some(echo(&owned, &request))
        };
        async move {
            match body {
                Some(body) => (StatusCode::OK, body),
                None => (StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "injected failure"})),
            }
        }
    })
    .await
}

/// Configuration over `backends` tuned for fast, deterministic tests:
/// no background probing, no handshake, short delays.
pub fn test_config(backends: &[&MockBackend]) -> AggregatorConfig {
    let mut config = AggregatorConfig::default();
    config.backends = backends.iter().map(|b| b.config()).collect();
    config.health_check.enabled = false;
    config.retries.base_delay_ms = 1;
    config.retries.max_delay_ms = 5;
    config.timeouts.connect_ms = 1_000;
    config.timeouts.backend_call_ms = 2_000;
    config.timeouts.request_ms = 10_000;
    config.reload.drain_grace_secs = 5;
    config.reload.watch = false;
    config
}

pub async fn dispatcher(config: AggregatorConfig) -> Dispatcher {
    let cache = Arc::new(CacheLayer::new(config.cache.clone()));
    let manager = ReloadManager::new(config, cache).await.unwrap();
    Dispatcher::new(Arc::new(manager))
}
