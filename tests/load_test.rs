//! Load testing through the HTTP front.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::mpsc;

use mcp_aggregator::http::HttpServer;
use mcp_aggregator::lifecycle::Shutdown;

mod common;

async fn start_server(dispatcher: mcp_aggregator::Dispatcher, shutdown: &Shutdown) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (_updates_tx, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(dispatcher);
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });
    addr
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_load_performance() {
    let a = common::start_echo_backend("a").await;
    let b = common::start_echo_backend("b").await;
    let c = common::start_echo_backend("c").await;
    let dispatcher = common::dispatcher(common::test_config(&[&a, &b, &c])).await;

    let shutdown = Shutdown::new();
    let addr = start_server(dispatcher, &shutdown).await;

    let concurrency = 20;
    let requests_per_task = 25;
    let distinct_keys = 40;
    let total_requests = concurrency * requests_per_task;

    let client = client();
    let url = format!("http://{}/rpc", addr);
    let start = Instant::now();

    let mut tasks = Vec::new();
    for task in 0..concurrency {
        let client = client.clone();
        let url = url.clone();
        tasks.push(tokio::spawn(async move {
            let mut latencies = Vec::new();
            for i in 0..requests_per_task {
                let n = (task * requests_per_task + i) % distinct_keys;
                let id = format!("{}-{}", task, i);
                let body = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": "tools/call",
                    "params": {"name": "lookup", "arguments": {"n": n}}
                });

                let req_start = Instant::now();
                let res = client.post(&url).json(&body).send().await.unwrap();
                assert!(res.status().is_success());
                let response: Value = res.json().await.unwrap();
                assert_eq!(response["id"], json!(id));
                assert_eq!(response["result"]["params"]["arguments"]["n"], json!(n));
                latencies.push(req_start.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for task in tasks {
        all_latencies.extend(task.await.unwrap());
    }
    let duration = start.elapsed();

    assert_eq!(all_latencies.len(), total_requests);
    // Each distinct request reached a backend exactly once; the rest came
    // from the cache or joined an in-flight call.
    assert_eq!(a.calls() + b.calls() + c.calls(), distinct_keys);

    all_latencies.sort();
    let p50 = all_latencies[all_latencies.len() / 2];
    let p99 = all_latencies[(all_latencies.len() as f64 * 0.99) as usize];

    println!("\n--- Load Test Results ---");
    println!("Total Requests: {}", total_requests);
    println!("Concurrency:    {}", concurrency);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec:   {:.2}", total_requests as f64 / duration.as_secs_f64());
    println!("P50 Latency:    {:?}", p50);
    println!("P99 Latency:    {:?}", p99);
    println!("-------------------------\n");

    shutdown.trigger();
}

#[tokio::test]
async fn test_operator_endpoints() {
    let a = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&a])).await;

    let shutdown = Shutdown::new();
    let addr = start_server(dispatcher, &shutdown).await;
    let client = client();

    let notification = client
        .post(format!("http://{}/rpc", addr))
        .json(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
        .send()
        .await
        .unwrap();
    assert_eq!(notification.status(), reqwest::StatusCode::ACCEPTED);
    assert!(notification.headers().contains_key("x-request-id"));

    let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"});
    for _ in 0..2 {
        client.post(format!("http://{}/rpc", addr)).json(&request).send().await.unwrap();
    }
    assert_eq!(a.calls(), 1);

    let health: Value = client.get(format!("http://{}/health", addr)).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["generation"], json!(1));
    assert_eq!(health["healthy"], json!(1));
    assert_eq!(health["cache"]["misses"], json!(1));

    let backends: Value = client.get(format!("http://{}/backends", addr)).send().await.unwrap().json().await.unwrap();
    assert_eq!(backends["backends"][0]["endpoint"], json!(a.endpoint()));

    let flushed: Value = client
        .post(format!("http://{}/cache/flush", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(flushed["exact_entries"], json!(0));

    client.post(format!("http://{}/rpc", addr)).json(&request).send().await.unwrap();
    assert_eq!(a.calls(), 2);

    shutdown.trigger();
}

#[tokio::test]
async fn test_graceful_shutdown_stops_accepting() {
    let a = common::start_echo_backend("a").await;
    let dispatcher = common::dispatcher(common::test_config(&[&a])).await;

    let shutdown = Shutdown::new();
    let addr = start_server(dispatcher, &shutdown).await;
    let client = reqwest::Client::builder().no_proxy().pool_max_idle_per_host(0).build().unwrap();

    let res = client.get(format!("http://{}/health", addr)).send().await.unwrap();
    assert!(res.status().is_success());

    shutdown.trigger();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(client.get(format!("http://{}/health", addr)).send().await.is_err());
}
