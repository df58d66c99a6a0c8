//! Cache and request coalescing against live backends.

use std::time::Duration;

use futures_util::future::join_all;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use mcp_aggregator::protocol::{parse_message, JsonRpcRequest};

mod common;

#[tokio::test]
async fn test_concurrent_identical_requests_hit_backend_once() {
    let backend = common::start_slow_backend("a", Duration::from_millis(200)).await;
    let dispatcher = common::dispatcher(common::test_config(&[&backend])).await;
    let cancel = CancellationToken::new();

    let request = JsonRpcRequest::new(1, "tools/call", Some(json!({"name": "read", "arguments": {"path": "/etc"}})));
    let results = join_all((0..8).map(|_| dispatcher.dispatch(&request, &cancel))).await;

    assert_eq!(backend.calls(), 1);
    let first = results[0].as_ref().unwrap();
    for result in &results {
        assert_eq!(result.as_ref().unwrap(), first);
    }

    // Later identical requests are served from cache.
    dispatcher.dispatch(&request, &cancel).await.unwrap();
    assert_eq!(backend.calls(), 1);
    assert!(dispatcher.cache().stats().coalesced >= 1);
}

#[tokio::test]
async fn test_key_ignores_id_and_param_order() {
    let backend = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&backend])).await;
    let cancel = CancellationToken::new();

    let first = parse_message(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"x","arguments":{"a":1,"b":[1,2]}}}"#)
        .unwrap();
    let second = parse_message(br#"{"jsonrpc":"2.0","id":"other","method":"tools/call","params":{"arguments":{"b":[1,2],"a":1},"name":"x"}}"#)
        .unwrap();

    dispatcher.dispatch(&first, &cancel).await.unwrap();
    dispatcher.dispatch(&second, &cancel).await.unwrap();
    assert_eq!(backend.calls(), 1);

    // Array order is significant.
    let third = parse_message(br#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"x","arguments":{"a":1,"b":[2,1]}}}"#)
        .unwrap();
    dispatcher.dispatch(&third, &cancel).await.unwrap();
    assert_eq!(backend.calls(), 2);
}

#[tokio::test]
async fn test_response_carries_callers_id() {
    let backend = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&backend])).await;
    let cancel = CancellationToken::new();

    let one = dispatcher
        .handle(JsonRpcRequest::new("first", "tools/list", None), &cancel)
        .await
        .unwrap();
    let two = dispatcher
        .handle(JsonRpcRequest::new(99, "tools/list", None), &cancel)
        .await
        .unwrap();

    assert_eq!(one.id, json!("first"));
    assert_eq!(two.id, json!(99));
    assert_eq!(one.result, two.result);
    assert_eq!(backend.calls(), 1);
}

#[tokio::test]
async fn test_bypass_methods_are_coalesced_but_not_stored() {
    let backend = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&backend])).await;
    let cancel = CancellationToken::new();

    let ping = JsonRpcRequest::new(1, "ping", None);
    dispatcher.dispatch(&ping, &cancel).await.unwrap();
    dispatcher.dispatch(&ping, &cancel).await.unwrap();
    assert_eq!(backend.probes(), 2);
}

#[tokio::test]
async fn test_flush_forces_recompute() {
    let backend = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&backend])).await;
    let cancel = CancellationToken::new();

    let request = JsonRpcRequest::new(1, "resources/list", None);
    let before: Value = dispatcher.dispatch(&request, &cancel).await.unwrap();
    dispatcher.cache().flush();
    let after: Value = dispatcher.dispatch(&request, &cancel).await.unwrap();

    assert_eq!(before, after);
    assert_eq!(backend.calls(), 2);
}
