//! End-to-end: endpoint calls between two real clients through a real
//! in-process server, plus the legacy HTTP endpoint path.

use hub_client::{Client, EndpointType, Json};
use hub_protocol::{Address, App, EndpointInfo};
use hub_server::AppState;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

/// Spin up an in-process server bound to a random port.
async fn start_server() -> (AppState, SocketAddr) {
    let state = AppState::new(None);
    state.init().await;
    let router = hub_server::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("server error");
    });
    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(20)).await;
    (state, addr)
}

async fn connect_client(addr: SocketAddr, name: &str) -> Client {
    let client = Client::new(
        App::new(name, "e2e", "1.0.0"),
        Address::new("127.0.0.1", addr.port()),
    )
    .await
    .expect("build client");
    client.start().await.expect("start client");
    client
}

fn echo_endpoint(owner: &str) -> EndpointType<String, String> {
    EndpointType::new(
        EndpointInfo::new(owner, "echo"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    )
}

/// Invoke with retries while the advertisement propagates to the server.
async fn invoke_with_retry(
    client: &Client,
    endpoint: &EndpointType<String, String>,
    request: &str,
) -> Result<String, hub_client::EndpointCallError> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match client
            .endpoints()
            .invoke(endpoint, &request.to_owned())
            .await
        {
            Err(error)
                if error.to_string().contains("unknown endpoint")
                    && tokio::time::Instant::now() < deadline =>
            {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            outcome => return outcome,
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn endpoint_round_trip_between_two_clients() {
    let (_state, addr) = start_server().await;
    let host = connect_client(addr, "alpha").await;
    let caller = connect_client(addr, "beta").await;

    let endpoint = echo_endpoint("e2e/alpha");
    host.endpoints()
        .register(&endpoint, |req: String| async move { Ok(req) })
        .await
        .expect("register echo");

    let reply = invoke_with_retry(&caller, &endpoint, "hi")
        .await
        .expect("echo round trip");
    assert_eq!(reply, "hi");

    host.stop().await.expect("stop host");
    caller.stop().await.expect("stop caller");
}

#[tokio::test]
async fn handler_failures_reach_the_caller_with_context() {
    let (_state, addr) = start_server().await;
    let host = connect_client(addr, "alpha").await;
    let caller = connect_client(addr, "beta").await;

    let endpoint = echo_endpoint("e2e/alpha");
    host.endpoints()
        .register(&endpoint, |_req: String| async move { Err("bad".into()) })
        .await
        .expect("register failing handler");

    let error = invoke_with_retry(&caller, &endpoint, "hi")
        .await
        .expect_err("handler failure must surface");
    let text = error.to_string();
    assert!(text.contains("bad"), "missing message in: {text}");
    assert!(text.contains("e2e/alpha:echo"), "missing key in: {text}");

    host.stop().await.expect("stop host");
    caller.stop().await.expect("stop caller");
}

#[tokio::test]
async fn calls_to_unregistered_endpoints_fail() {
    let (_state, addr) = start_server().await;
    let caller = connect_client(addr, "beta").await;

    let error = caller
        .endpoints()
        .invoke(&echo_endpoint("e2e/nobody"), &"hi".to_owned())
        .await
        .expect_err("no handler registered anywhere");
    assert!(error.to_string().contains("unknown endpoint"));

    caller.stop().await.expect("stop caller");
}

#[tokio::test]
async fn legacy_http_path_serves_server_endpoints() {
    let (_state, addr) = start_server().await;
    let client = connect_client(addr, "writer").await;

    client
        .registry()
        .set("greeting", json!("hello"), None)
        .await
        .expect("set registry value");

    let http = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/api/v1/registry:get", addr.port());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let value: serde_json::Value = http
            .post(&url)
            .json(&json!("e2e/writer:greeting"))
            .send()
            .await
            .expect("http call")
            .json()
            .await
            .expect("json body");
        if value == json!("hello") {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "registry value never became visible over HTTP, last seen: {value}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let missing: serde_json::Value = http
        .post(&url)
        .json(&json!("e2e/writer:unset"))
        .send()
        .await
        .expect("http call")
        .json()
        .await
        .expect("json body");
    assert_eq!(missing, serde_json::Value::Null);

    // The built-in apps table lists the live session.
    let apps: serde_json::Value = http
        .post(format!(
            "http://127.0.0.1:{}/api/v1/table:item_fetch",
            addr.port()
        ))
        .json(&json!({"type": "server:apps", "limit": 10}))
        .send()
        .await
        .expect("http call")
        .json()
        .await
        .expect("json body");
    assert!(
        apps.get("e2e/writer").is_some(),
        "connected app missing from server:apps: {apps}"
    );

    client.stop().await.expect("stop client");
}
