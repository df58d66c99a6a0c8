//! Hot reload under traffic.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use mcp_aggregator::config::save_config;
use mcp_aggregator::config::watcher::ConfigWatcher;
use mcp_aggregator::http::HttpServer;
use mcp_aggregator::lifecycle::Shutdown;
use mcp_aggregator::protocol::JsonRpcRequest;

mod common;

fn call(n: usize) -> JsonRpcRequest {
    JsonRpcRequest::new(n as u64, "tools/call", Some(json!({"name": "work", "arguments": {"n": n}})))
}

#[tokio::test]
async fn test_in_flight_requests_finish_on_their_generation() {
    let old_a = common::start_slow_backend("old-a", Duration::from_millis(400)).await;
    let old_b = common::start_slow_backend("old-b", Duration::from_millis(400)).await;
    let new_a = common::start_echo_backend("new-a").await;
    let new_b = common::start_echo_backend("new-b").await;

    let dispatcher = common::dispatcher(common::test_config(&[&old_a, &old_b])).await;
    let manager = dispatcher.manager().clone();
    let old_generation = manager.current();

    const IN_FLIGHT: usize = 12;
    let pending: Vec<_> = (0..IN_FLIGHT)
        .map(|n| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.dispatch(&call(n), &CancellationToken::new()).await })
        })
        .collect();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(old_generation.in_flight(), IN_FLIGHT);

    let version = manager.apply(common::test_config(&[&new_a, &new_b])).await.unwrap();
    assert_eq!(version, 2);

    // New traffic only sees the new backends, while the old requests are still running.
    let cancel = CancellationToken::new();
    for n in 100..140 {
        let value = dispatcher.dispatch(&call(n), &cancel).await.unwrap();
        let backend = value["backend"].as_str().unwrap();
        assert!(backend.starts_with("new-"), "routed to {}", backend);
    }
    assert!(old_generation.pools().iter().all(|(_, pool)| !pool.is_closed()));

    let finished = join_all(pending).await;
    let served_by: HashSet<String> = finished
        .into_iter()
        .map(|joined| joined.unwrap().unwrap()["backend"].as_str().unwrap().to_string())
        .collect();
    assert!(served_by.iter().all(|backend| backend.starts_with("old-")));
    assert_eq!(old_a.calls() + old_b.calls(), IN_FLIGHT);

    manager.drain_all().await;
    assert_eq!(old_generation.in_flight(), 0);
    assert!(old_generation.pools().iter().all(|(_, pool)| pool.is_closed()));
}

/// Backend named `name` that answers `{"origin": origin}` after `delay`.
async fn start_origin_backend(name: &str, origin: &'static str, delay: Duration) -> common::MockBackend {
    common::start_programmable_backend(name, move |request| async move {
        tokio::time::sleep(delay).await;
        (
            axum::http::StatusCode::OK,
            json!({"jsonrpc": "2.0", "id": request["id"], "result": {"origin": origin}}),
        )
    })
    .await
}

#[tokio::test]
async fn test_moved_backend_never_serves_old_endpoint_after_swap() {
    let old = start_origin_backend("a", "old-endpoint", Duration::from_millis(400)).await;
    let new = start_origin_backend("a", "new-endpoint", Duration::ZERO).await;

    let dispatcher = common::dispatcher(common::test_config(&[&old])).await;
    let manager = dispatcher.manager().clone();

    let pending = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(&call(1), &CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Same id, different endpoint.
    manager.apply(common::test_config(&[&new])).await.unwrap();

    let cancel = CancellationToken::new();
    let after_swap = dispatcher.dispatch(&call(1), &cancel).await.unwrap();
    assert_eq!(after_swap["origin"], json!("new-endpoint"));

    // The old request still finishes on the endpoint it started on...
    let before_swap = pending.await.unwrap().unwrap();
    assert_eq!(before_swap["origin"], json!("old-endpoint"));

    // ...but its answer is not left behind in the cache.
    let later = dispatcher.dispatch(&call(1), &cancel).await.unwrap();
    assert_eq!(later["origin"], json!("new-endpoint"));
    assert_eq!(old.calls(), 1);
    assert_eq!(new.calls(), 1);
}

#[tokio::test]
async fn test_rejected_reload_keeps_serving() {
    let backend = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&backend])).await;

    let bad = common::test_config(&[&backend, &backend]);
    assert!(dispatcher.manager().apply(bad).await.is_err());

    assert_eq!(dispatcher.manager().current().version(), 1);
    let value = dispatcher.dispatch(&call(1), &CancellationToken::new()).await.unwrap();
    assert_eq!(value["backend"], json!("a"));
}

#[tokio::test]
async fn test_file_change_triggers_reload() {
    let first = common::start_echo_backend("first").await;
    let second = common::start_echo_backend("second").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aggregator.toml");
    save_config(&path, &common::test_config(&[&first])).unwrap();

    let dispatcher = common::dispatcher(common::test_config(&[&first])).await;
    let manager = dispatcher.manager().clone();

    let (watcher, updates) = ConfigWatcher::new(&path);
    let _watcher = watcher.run().unwrap();
    tokio::spawn(manager.clone().follow(updates, CancellationToken::new()));

    // Give the watcher a moment to register before the write.
    tokio::time::sleep(Duration::from_millis(200)).await;
    save_config(&path, &common::test_config(&[&second])).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while manager.current().version() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "reload not observed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let value = dispatcher.dispatch(&call(1), &CancellationToken::new()).await.unwrap();
    assert_eq!(value["backend"], json!("second"));
}

#[tokio::test]
async fn test_http_shutdown_lets_queued_reload_finish() {
    let first = common::start_echo_backend("first").await;
    let second = common::start_echo_backend("second").await;
    let dispatcher = common::dispatcher(common::test_config(&[&first])).await;
    let manager = dispatcher.manager().clone();
    let old = manager.current();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let (updates_tx, updates) = tokio::sync::mpsc::unbounded_channel();
    let shutdown = Shutdown::new();
    let server = tokio::spawn(HttpServer::new(dispatcher).run(listener, updates, shutdown.subscribe()));

    updates_tx.send(common::test_config(&[&second])).unwrap();
    shutdown.trigger();
    server.await.unwrap().unwrap();

    // The reload completed and registered its drain, so shutdown retires it.
    assert_eq!(manager.current().version(), 2);
    manager.drain_all().await;
    assert!(old.pools().iter().all(|(_, pool)| pool.is_closed()));
}
