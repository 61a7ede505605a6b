//! End-to-end: reconnect behavior.  After an unexpected connection loss
//! the running client reconnects by itself and replays its subscriptions:
//! the listening table re-listens and re-primes its cache, and hosted
//! endpoints are advertised again.

use hub_client::table::TableListener;
use hub_client::{Client, EndpointType, Json, Keyable, model_table};
use hub_protocol::{Address, App, EndpointInfo, TableInfo};
use hub_server::AppState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Note {
    id: String,
    body: String,
}

impl Keyable for Note {
    fn key(&self) -> String {
        self.id.clone()
    }
}

fn note(id: &str, body: &str) -> Note {
    Note {
        id: id.to_owned(),
        body: body.to_owned(),
    }
}

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

async fn wait_for_size(table: &hub_client::Table<Note>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if table.size().await.map(|size| size == expected).unwrap_or(false) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for table size {expected}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_cache_len(table: &hub_client::Table<Note>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if table.cache().await.len() == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for cache length {expected}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_for_connected(client: &Client, connected: bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if client.connection().is_connected() == connected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for connected == {connected}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn a_running_client_reconnects_and_replays_its_subscriptions() {
    let (_state, addr) = start_server().await;

    // Seed 60 items before the subject ever connects.
    let seeder = connect_client(addr, "seeder").await;
    let mut seed_info = TableInfo::new("notes", "primed");
    seed_info.cache_size = Some(50);
    let seed_table = seeder
        .tables()
        .register(&model_table::<Note>(seed_info.clone()))
        .await
        .expect("register table");
    let notes: Vec<Note> = (1..=60)
        .map(|i| note(&format!("k{i:04}"), &format!("body {i}")))
        .collect();
    seed_table.add(&notes).await.expect("seed");
    wait_for_size(&seed_table, 60).await;

    // Subject: listening table with cache_size, plus a hosted endpoint.
    let subject = connect_client(addr, "subject").await;
    let table = subject
        .tables()
        .get(&model_table::<Note>(seed_info))
        .await
        .expect("view table");
    table.add_listener(TableListener::default()).await;

    let ping = EndpointType::<String, String>::new(
        EndpointInfo::new("e2e/subject", "ping"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    );
    subject
        .endpoints()
        .register(&ping, |_req: String| async move { Ok("pong".to_owned()) })
        .await
        .expect("register ping");

    // First connect primes exactly cache_size items.
    wait_for_cache_len(&table, 50).await;

    // Unexpected loss: drop the connection out from under the running
    // client; it must come back by itself.
    subject.connection().disconnect().await;
    wait_for_connected(&subject, true).await;

    // The replayed table:listen is live again: a fresh mutation reaches the
    // subject's cache.
    seed_table
        .add(&[note("k0061", "after reconnect")])
        .await
        .expect("post-reconnect add");
    wait_for_cache_len(&table, 51).await;
    assert!(table.cache().await.contains_key("k0061"));

    // The re-advertised endpoint answers again.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match seeder
            .endpoints()
            .invoke(&ping, &"hello".to_owned())
            .await
        {
            Ok(reply) => {
                assert_eq!(reply, "pong");
                break;
            }
            Err(error) => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "endpoint never came back: {error}"
                );
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        }
    }

    subject.stop().await.expect("stop subject");
    seeder.stop().await.expect("stop seeder");
}

#[tokio::test]
async fn duplicate_app_keys_are_rejected() {
    let (_state, addr) = start_server().await;
    let first = connect_client(addr, "dup").await;

    // Same app key: the server closes the second socket instead of
    // adopting it.
    let second = Client::new(
        App::new("dup", "e2e", "1.0.0"),
        Address::new("127.0.0.1", addr.port()),
    )
    .await
    .expect("build client");
    second.start().await.expect("socket opens before rejection");
    wait_for_connected(&second, false).await;
    assert!(first.connection().is_connected(), "first session survives");

    second.stop().await.expect("stop second");
    first.stop().await.expect("stop first");
}

#[tokio::test]
async fn lifecycle_errors_are_reported() {
    let (_state, addr) = start_server().await;
    let client = connect_client(addr, "lifecycle").await;

    assert!(matches!(
        client.start().await,
        Err(hub_client::ClientError::AlreadyRunning)
    ));
    client.stop().await.expect("stop");
    assert!(matches!(
        client.stop().await,
        Err(hub_client::ClientError::NotRunning)
    ));
}
