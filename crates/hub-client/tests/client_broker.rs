//! Client protocol tests against a scripted mock broker.
//!
//! Covers the handshake, the endpoint caller and handler roles, queued
//! calls, table mutation fan-in, the client side of the write-proxy
//! pipeline, and the full re-subscription sequence on reconnect.

use hub_client::table::TableListener;
use hub_client::{Client, EndpointType, Json, Keyable, model_table};
use hub_protocol::{
    Address, App, EndpointCall, EndpointInfo, Envelope, TableInfo, TableProxy, event_keys,
};
use hub_test_utils::MockBroker;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

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

async fn start_client(broker: &MockBroker, name: &str) -> Client {
    let client = Client::new(
        App::new(name, "itest", "0.1.0"),
        Address::new("127.0.0.1", broker.port()),
    )
    .await
    .expect("build client");
    client.start().await.expect("start client");
    client
}

async fn within<T>(what: &str, fut: impl Future<Output = Option<T>>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("broker closed while waiting for {what}"))
}

fn echo_endpoint() -> EndpointType<String, String> {
    EndpointType::new(
        EndpointInfo::new("itest/peer", "echo"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    )
}

#[tokio::test]
async fn handshake_announces_the_app_first() {
    let broker = MockBroker::start().await.expect("start broker");
    let client = start_client(&broker, "hello").await;

    let first = within("connect", broker.recv()).await;
    assert_eq!(first.kind, event_keys::CONNECT);
    let app: App = serde_json::from_value(first.data).expect("connect carries the app");
    assert_eq!(app.key(), "itest/hello");

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn invoke_round_trips_through_the_broker() {
    let broker = MockBroker::start().await.expect("start broker");
    broker
        .respond_to("itest/peer:echo", |data| Ok(data))
        .await;
    let client = start_client(&broker, "caller").await;

    let reply = client
        .endpoints()
        .invoke(&echo_endpoint(), &"hi".to_owned())
        .await
        .expect("echo reply");
    assert_eq!(reply, "hi");

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn remote_errors_surface_message_and_endpoint_key() {
    let broker = MockBroker::start().await.expect("start broker");
    broker
        .respond_to("itest/peer:echo", |_| Err("bad".to_owned()))
        .await;
    let client = start_client(&broker, "caller").await;

    let error = client
        .endpoints()
        .invoke(&echo_endpoint(), &"hi".to_owned())
        .await
        .expect_err("handler failure must fail the call");
    let text = error.to_string();
    assert!(text.contains("bad"), "missing message in: {text}");
    assert!(text.contains("itest/peer:echo"), "missing key in: {text}");

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn calls_issued_before_connect_are_queued_and_flushed() {
    let broker = MockBroker::start().await.expect("start broker");
    broker
        .respond_to("itest/peer:echo", |data| Ok(data))
        .await;
    let client = Client::new(
        App::new("early", "itest", "0.1.0"),
        Address::new("127.0.0.1", broker.port()),
    )
    .await
    .expect("build client");

    let endpoints = Arc::clone(client.endpoints());
    let call = tokio::spawn(async move {
        endpoints
            .invoke(&echo_endpoint(), &"queued".to_owned())
            .await
    });
    // The call is parked while disconnected; nothing is on the wire yet.
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.start().await.expect("start client");
    let reply = call.await.expect("join").expect("queued call resolves");
    assert_eq!(reply, "queued");

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn registered_handlers_answer_inbound_calls() {
    let broker = MockBroker::start().await.expect("start broker");
    let client = start_client(&broker, "host").await;

    let endpoint = EndpointType::<String, String>::new(
        EndpointInfo::new("itest/host", "shout"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    );
    client
        .endpoints()
        .register(&endpoint, |req: String| async move {
            if req == "boom" {
                return Err("bad input".into());
            }
            Ok(req.to_uppercase())
        })
        .await
        .expect("register handler");
    within("endpoint:register", broker.wait_for(event_keys::ENDPOINT_REGISTER)).await;

    broker
        .push(Envelope::new(
            event_keys::ENDPOINT_CALL,
            json!({"type": "itest/host:shout", "key": 41, "data": "hi"}),
        ))
        .await;
    let reply = within("endpoint:receive", broker.wait_for(event_keys::ENDPOINT_RECEIVE)).await;
    let payload: EndpointCall = serde_json::from_value(reply.data).expect("receive payload");
    assert_eq!(payload.key, 41);
    assert_eq!(payload.data, json!("HI"));

    broker
        .push(Envelope::new(
            event_keys::ENDPOINT_CALL,
            json!({"type": "itest/host:shout", "key": 42, "data": "boom"}),
        ))
        .await;
    let reply = within("endpoint:error", broker.wait_for(event_keys::ENDPOINT_ERROR)).await;
    let payload: hub_protocol::EndpointError =
        serde_json::from_value(reply.data).expect("error payload");
    assert_eq!(payload.key, 42);
    assert!(payload.error.contains("bad input"));

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn pushed_mutations_update_the_cache_in_server_order() {
    let broker = MockBroker::start().await.expect("start broker");
    let client = start_client(&broker, "viewer").await;

    let table = client
        .tables()
        .register(&model_table::<Note>(TableInfo::new("notes", "items")))
        .await
        .expect("register table");
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    table
        .listen(move |cache: IndexMap<String, Note>| {
            let seen = Arc::clone(&sink);
            async move {
                seen.lock().await.push(cache.len());
            }
        })
        .await;
    within("table:listen", broker.wait_for(event_keys::TABLE_LISTEN)).await;

    broker
        .push(Envelope::new(
            event_keys::TABLE_ITEM_ADD,
            json!({
                "type": "notes:items",
                "items": {
                    "k1": {"id": "k1", "body": "one"},
                    "k2": {"id": "k2", "body": "two"}
                }
            }),
        ))
        .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if seen.lock().await.last() == Some(&2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache update listener fires");

    let keys: Vec<String> = table.cache().await.keys().cloned().collect();
    assert_eq!(keys, ["k1", "k2"]);

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn proxy_pipeline_transforms_and_acks_the_batch() {
    let broker = MockBroker::start().await.expect("start broker");
    let client = start_client(&broker, "guard").await;

    let table = client
        .tables()
        .register(&model_table::<Note>(TableInfo::new("notes", "items")))
        .await
        .expect("register table");
    // p1 drops keys starting with "x", p2 rewrites the payload.
    table
        .proxy(|item: Note| {
            if item.id.starts_with('x') {
                None
            } else {
                Some(item)
            }
        })
        .await;
    table
        .proxy(|mut item: Note| {
            item.body = format!("[{}]", item.body);
            Some(item)
        })
        .await;
    within("table:proxy_listen", broker.wait_for(event_keys::TABLE_PROXY_LISTEN)).await;

    broker
        .push(Envelope::new(
            event_keys::TABLE_PROXY,
            json!({
                "type": "notes:items",
                "key": 7,
                "items": {
                    "a": {"id": "a", "body": "alpha"},
                    "xa": {"id": "xa", "body": "dropme"},
                    "b": {"id": "b", "body": "beta"}
                }
            }),
        ))
        .await;

    let ack = loop {
        let envelope = within("proxy ack", broker.wait_for(event_keys::ENDPOINT_CALL)).await;
        let call: EndpointCall = serde_json::from_value(envelope.data).expect("call payload");
        if call.endpoint == "table:proxy" {
            break call;
        }
    };
    let payload: TableProxy = serde_json::from_value(ack.data).expect("proxy payload");
    assert_eq!(payload.key, 7);
    let keys: Vec<&str> = payload.items.keys().map(String::as_str).collect();
    assert_eq!(keys, ["a", "b"]);
    assert_eq!(payload.items["a"], json!({"id": "a", "body": "[alpha]"}));
    assert_eq!(payload.items["b"], json!({"id": "b", "body": "[beta]"}));

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn reconnect_replays_subscriptions_in_phase_order() {
    let broker = MockBroker::start().await.expect("start broker");
    let client = Client::new(
        App::new("resub", "itest", "0.1.0"),
        Address::new("127.0.0.1", broker.port()),
    )
    .await
    .expect("build client");

    // Outstanding state before the first connect: an owned, listening,
    // proxying table, a registry subscription, and a hosted endpoint.
    let table = client
        .tables()
        .register(&model_table::<Note>(TableInfo::new("notes", "items")))
        .await
        .expect("register table");
    table
        .add_listener(TableListener::<Note>::default())
        .await;
    table.proxy(Some).await;
    client
        .registry()
        .listen("theme", None, |_value: Value| async {})
        .await
        .expect("registry listen");
    let endpoint = EndpointType::<String, String>::new(
        EndpointInfo::new("itest/resub", "ping"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    );
    client
        .endpoints()
        .register(&endpoint, |_req: String| async { Ok("pong".to_owned()) })
        .await
        .expect("register endpoint");

    client.start().await.expect("start client");
    let expect_sequence = |label: &'static str| {
        let broker = &broker;
        async move {
            let kinds = [
                event_keys::CONNECT,
                event_keys::TABLE_REGISTER,
                event_keys::TABLE_LISTEN,
                event_keys::TABLE_PROXY_LISTEN,
                event_keys::REGISTRY_LISTEN,
                event_keys::ENDPOINT_REGISTER,
            ];
            for kind in kinds {
                let envelope = within(kind, broker.recv()).await;
                assert_eq!(
                    envelope.kind, kind,
                    "{label}: expected {kind}, got {}",
                    envelope.kind
                );
            }
        }
    };
    expect_sequence("initial connect").await;
    let first_session = broker.session_id().await.expect("live session");

    // Server-side drop; the running client reconnects and replays the
    // whole sequence under a fresh session id.
    broker.close_session().await;
    expect_sequence("reconnect").await;
    let second_session = broker.session_id().await.expect("replacement session");
    assert_ne!(first_session, second_session);

    client.stop().await.expect("stop client");
}

#[tokio::test]
async fn listening_table_with_cache_size_primes_after_listen() {
    let broker = MockBroker::start().await.expect("start broker");
    broker
        .respond_to("table:item_fetch", |data| {
            let req: hub_protocol::TableFetch =
                serde_json::from_value(data).map_err(|e| e.to_string())?;
            assert_eq!(req.limit, 50);
            Ok(json!({
                "k1": {"id": "k1", "body": "one"},
                "k2": {"id": "k2", "body": "two"}
            }))
        })
        .await;

    let client = Client::new(
        App::new("primer", "itest", "0.1.0"),
        Address::new("127.0.0.1", broker.port()),
    )
    .await
    .expect("build client");
    let mut info = TableInfo::new("notes", "items");
    info.cache_size = Some(50);
    let table = client
        .tables()
        .register(&model_table::<Note>(info))
        .await
        .expect("register table");
    table.add_listener(TableListener::<Note>::default()).await;

    client.start().await.expect("start client");
    within("table:listen", broker.wait_for(event_keys::TABLE_LISTEN)).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if table.cache().await.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("cache primed from fetch");

    client.stop().await.expect("stop client");
}
