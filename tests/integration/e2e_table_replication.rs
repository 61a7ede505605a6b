//! End-to-end: table replication — mutation echo to every listener,
//! ordered caches, endpoint reads, and the pagination law.

use futures_util::StreamExt;
use hub_client::table::TableListener;
use hub_client::{Client, Keyable, Table, model_table};
use hub_protocol::{Address, App, TableInfo};
use hub_server::AppState;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

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

async fn wait_for_size(table: &Table<Note>, expected: usize) {
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

async fn wait_for_cache_len(table: &Table<Note>, expected: usize) {
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

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn both_listeners_observe_an_add_in_order() {
    let (_state, addr) = start_server().await;
    let owner = connect_client(addr, "owner").await;
    let peer = connect_client(addr, "peer").await;

    let ty = model_table::<Note>(TableInfo::new("notes", "items"));
    let owned = owner.tables().register(&ty).await.expect("register table");
    let viewed = peer.tables().get(&ty).await.expect("view table");

    let owner_adds: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&owner_adds);
    owned
        .add_listener(TableListener {
            on_add: Some(Arc::new(move |items: IndexMap<String, Note>| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().await.push(items.keys().cloned().collect());
                })
            })),
            ..TableListener::default()
        })
        .await;
    viewed.add_listener(TableListener::default()).await;
    // Both listen frames are in flight on separate sockets; give the server
    // a moment to process them before the mutation arrives.
    tokio::time::sleep(Duration::from_millis(50)).await;

    viewed
        .add(&[note("k1", "one"), note("k2", "two")])
        .await
        .expect("send add");

    wait_for_cache_len(&owned, 2).await;
    wait_for_cache_len(&viewed, 2).await;

    let owner_keys: Vec<String> = owned.cache().await.keys().cloned().collect();
    let peer_keys: Vec<String> = viewed.cache().await.keys().cloned().collect();
    assert_eq!(owner_keys, ["k1", "k2"]);
    assert_eq!(peer_keys, ["k1", "k2"]);
    assert_eq!(*owner_adds.lock().await, vec![vec!["k1", "k2"]]);

    owner.stop().await.expect("stop owner");
    peer.stop().await.expect("stop peer");
}

#[tokio::test]
async fn iter_pages_through_the_full_key_space_exactly_once() {
    let (_state, addr) = start_server().await;
    let writer = connect_client(addr, "writer").await;

    let ty = model_table::<Note>(TableInfo::new("notes", "bulk"));
    let table = writer.tables().register(&ty).await.expect("register table");

    let notes: Vec<Note> = (1..=250)
        .map(|i| note(&format!("k{i:04}"), &format!("body {i}")))
        .collect();
    table.add(&notes).await.expect("bulk add");
    wait_for_size(&table, 250).await;

    let mut seen = Vec::new();
    let mut stream = std::pin::pin!(table.iter());
    while let Some(item) = stream.next().await {
        seen.push(item.expect("iter item").id);
    }
    assert_eq!(seen.len(), 250, "every key exactly once");
    let expected: Vec<String> = (1..=250).map(|i| format!("k{i:04}")).collect();
    assert_eq!(seen, expected, "server order preserved");

    writer.stop().await.expect("stop writer");
}

#[tokio::test]
async fn get_reads_through_to_the_server_and_caches() {
    let (_state, addr) = start_server().await;
    let writer = connect_client(addr, "writer").await;
    let reader = connect_client(addr, "reader").await;

    let ty = model_table::<Note>(TableInfo::new("notes", "kv"));
    let write_table = writer.tables().register(&ty).await.expect("register");
    write_table
        .add(&[note("k1", "one")])
        .await
        .expect("send add");
    wait_for_size(&write_table, 1).await;

    let read_table = reader.tables().get(&ty).await.expect("view");
    assert!(read_table.cache().await.is_empty(), "no echo without listen");
    let item = read_table.get("k1").await.expect("get").expect("item found");
    assert_eq!(item, note("k1", "one"));
    assert_eq!(read_table.cache().await.len(), 1, "get merges into cache");
    assert!(
        read_table.get("missing").await.expect("get").is_none(),
        "absent keys resolve to none"
    );

    writer.stop().await.expect("stop writer");
    reader.stop().await.expect("stop reader");
}

#[tokio::test]
async fn remove_and_clear_propagate_to_listeners() {
    let (_state, addr) = start_server().await;
    let client = connect_client(addr, "solo").await;

    let ty = model_table::<Note>(TableInfo::new("notes", "mut"));
    let table = client.tables().register(&ty).await.expect("register");
    table.add_listener(TableListener::default()).await;

    table
        .add(&[note("k1", "one"), note("k2", "two"), note("k3", "three")])
        .await
        .expect("add");
    wait_for_cache_len(&table, 3).await;

    table.remove(&[note("k2", "two")]).await.expect("remove");
    wait_for_cache_len(&table, 2).await;
    let keys: Vec<String> = table.cache().await.keys().cloned().collect();
    assert_eq!(keys, ["k1", "k3"]);

    table.clear().await.expect("clear");
    wait_for_cache_len(&table, 0).await;
    assert_eq!(table.size().await.expect("size"), 0);

    client.stop().await.expect("stop client");
}
