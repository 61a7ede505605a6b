//! End-to-end: the write-proxy pipeline.  A guard client transforms every
//! write batch before the server commits it; only the final batch reaches
//! the store and the subscribers.

use hub_client::table::TableListener;
use hub_client::{Client, Keyable, model_table};
use hub_protocol::{Address, App, TableInfo};
use hub_server::AppState;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
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

async fn wait_for_cache_len(table: &hub_client::Table<Note>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if table.cache().await.len() == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for cache length {expected}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_size(table: &hub_client::Table<Note>, expected: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if table.size().await.map(|size| size == expected).unwrap_or(false) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for table size {expected}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_stage_pipeline_filters_and_rewrites_a_batch() {
    let (_state, addr) = start_server().await;
    let guard = connect_client(addr, "guard").await;
    let writer = connect_client(addr, "writer").await;
    let observer = connect_client(addr, "observer").await;

    let ty = model_table::<Note>(TableInfo::new("notes", "guarded"));
    let guard_table = guard.tables().register(&ty).await.expect("register");
    // Stage 1 drops keys starting with "x", stage 2 rewrites the body.
    guard_table
        .proxy(|item: Note| {
            if item.id.starts_with('x') {
                None
            } else {
                Some(item)
            }
        })
        .await;
    guard_table
        .proxy(|mut item: Note| {
            item.body = format!("[{}]", item.body);
            Some(item)
        })
        .await;

    let observer_table = observer.tables().get(&ty).await.expect("view");
    observer_table.add_listener(TableListener::default()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let writer_table = writer.tables().get(&ty).await.expect("view");
    writer_table
        .add(&[note("a", "alpha"), note("xa", "dropme"), note("b", "beta")])
        .await
        .expect("send batch");

    // Only the transformed survivors are committed and fanned out.
    wait_for_cache_len(&observer_table, 2).await;
    let cache = observer_table.cache().await;
    let keys: Vec<String> = cache.keys().cloned().collect();
    assert_eq!(keys, ["a", "b"]);
    assert_eq!(cache["a"], note("a", "[alpha]"));
    assert_eq!(cache["b"], note("b", "[beta]"));
    assert_eq!(
        writer_table.size().await.expect("size"),
        2,
        "dropped item must not reach the store"
    );

    guard.stop().await.expect("stop guard");
    writer.stop().await.expect("stop writer");
    observer.stop().await.expect("stop observer");
}

#[tokio::test]
async fn identity_proxies_pass_the_batch_through_unchanged() {
    let (_state, addr) = start_server().await;
    let guard = connect_client(addr, "guard").await;
    let writer = connect_client(addr, "writer").await;

    let ty = model_table::<Note>(TableInfo::new("notes", "passthrough"));
    let guard_table = guard.tables().register(&ty).await.expect("register");
    guard_table.proxy(Some).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let writer_table = writer.tables().get(&ty).await.expect("view");
    writer_table
        .add(&[note("k1", "one"), note("k2", "two")])
        .await
        .expect("send batch");

    wait_for_size(&writer_table, 2).await;
    let page = writer_table.fetch(10, None).await.expect("fetch");
    let keys: Vec<String> = page.keys().cloned().collect();
    assert_eq!(keys, ["k1", "k2"]);
    assert_eq!(page["k1"], note("k1", "one"));
    assert_eq!(page["k2"], note("k2", "two"));

    guard.stop().await.expect("stop guard");
    writer.stop().await.expect("stop writer");
}
