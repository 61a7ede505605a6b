// mock_broker: a scriptable WebSocket peer for client tests.
//
// Binds to port 0 (random) and exposes the actual bound port, so each test
// can spin up an isolated instance.
//
// # Protocol behavior
//
// - The first message from a client must be a `connect` envelope; the
//   broker assigns the session a fresh id (UUID v4) and replies with
//   `ready`.
// - Every inbound envelope is recorded and observable via `recv` /
//   `wait_for`.
// - `endpoint:call` envelopes whose endpoint has a responder installed are
//   answered with `endpoint:receive` (or `endpoint:error` when the
//   responder fails).
// - Only one live session at a time: a new connection replaces the old
//   push target.  `close_session` drops the current session from the
//   server side, which is how reconnect behavior is exercised; the
//   replacement session gets a new id, observable via `session_id`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use hub_protocol::{Envelope, event_keys};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::protocol::Message;

type Responder = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

enum SessionCommand {
    Send(Envelope),
    Close,
}

struct SessionEntry {
    id: String,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

#[derive(Clone, Default)]
struct Shared {
    session: Arc<Mutex<Option<SessionEntry>>>,
    responders: Arc<Mutex<HashMap<String, Responder>>>,
}

pub struct MockBroker {
    addr: SocketAddr,
    shared: Shared,
    inbound: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    /// Handle to the background accept loop; dropped with the broker.
    _task: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    /// Start the broker, binding to a random available port.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shared = Shared::default();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let accept_shared = shared.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let shared = accept_shared.clone();
                        let inbound_tx = inbound_tx.clone();
                        tokio::spawn(async move {
                            // Connection errors are expected in tests (e.g.
                            // the client drops); swallow them.
                            let _ = handle_connection(stream, shared, inbound_tx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            shared,
            inbound: Mutex::new(inbound_rx),
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Installs a responder for an endpoint key.
    pub async fn respond_to(
        &self,
        endpoint: &str,
        responder: impl Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        self.shared
            .responders
            .lock()
            .await
            .insert(endpoint.to_owned(), Arc::new(responder));
    }

    /// Pushes an envelope to the connected client.  Returns false when no
    /// session is live.
    pub async fn push(&self, envelope: Envelope) -> bool {
        match self.shared.session.lock().await.as_ref() {
            Some(entry) => entry.tx.send(SessionCommand::Send(envelope)).is_ok(),
            None => false,
        }
    }

    /// Id assigned to the current session, if one is live.
    pub async fn session_id(&self) -> Option<String> {
        self.shared
            .session
            .lock()
            .await
            .as_ref()
            .map(|entry| entry.id.clone())
    }

    /// Closes the current session from the server side.
    pub async fn close_session(&self) {
        if let Some(entry) = self.shared.session.lock().await.take() {
            let _ = entry.tx.send(SessionCommand::Close);
        }
    }

    /// Next recorded inbound envelope.
    pub async fn recv(&self) -> Option<Envelope> {
        self.inbound.lock().await.recv().await
    }

    /// Skips recorded envelopes until one of the given kind arrives.
    pub async fn wait_for(&self, kind: &str) -> Option<Envelope> {
        loop {
            let envelope = self.recv().await?;
            if envelope.kind == kind {
                return Some(envelope);
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    shared: Shared,
    inbound_tx: mpsc::UnboundedSender<Envelope>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let session_id = uuid::Uuid::new_v4().to_string();
    let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionCommand>();
    let writer = tokio::spawn(async move {
        while let Some(command) = session_rx.recv().await {
            match command {
                SessionCommand::Send(envelope) => {
                    let Ok(text) = serde_json::to_string(&envelope) else {
                        continue;
                    };
                    if write.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SessionCommand::Close => {
                    let _ = write.close().await;
                    break;
                }
            }
        }
    });

    let mut connected = false;
    while let Some(message) = read.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let envelope: Envelope = serde_json::from_str(&text)?;

        if !connected {
            // First envelope must be the connect handshake.
            if envelope.kind != event_keys::CONNECT {
                break;
            }
            connected = true;
            *shared.session.lock().await = Some(SessionEntry {
                id: session_id.clone(),
                tx: session_tx.clone(),
            });
            let _ = session_tx.send(SessionCommand::Send(Envelope::new(
                event_keys::READY,
                Value::Null,
            )));
            let _ = inbound_tx.send(envelope);
            continue;
        }

        if envelope.kind == event_keys::ENDPOINT_CALL {
            if let Ok(call) = serde_json::from_value::<hub_protocol::EndpointCall>(
                envelope.data.clone(),
            ) {
                let responder = {
                    let responders = shared.responders.lock().await;
                    responders.get(&call.endpoint).cloned()
                };
                if let Some(responder) = responder {
                    let reply = match responder(call.data.clone()) {
                        Ok(data) => Envelope::new(
                            event_keys::ENDPOINT_RECEIVE,
                            serde_json::to_value(hub_protocol::EndpointCall {
                                endpoint: call.endpoint.clone(),
                                key: call.key,
                                data,
                            })?,
                        ),
                        Err(error) => Envelope::new(
                            event_keys::ENDPOINT_ERROR,
                            serde_json::to_value(hub_protocol::EndpointError {
                                endpoint: call.endpoint.clone(),
                                key: call.key,
                                error,
                            })?,
                        ),
                    };
                    let _ = session_tx.send(SessionCommand::Send(reply));
                }
            }
        }

        let _ = inbound_tx.send(envelope);
    }

    writer.abort();
    Ok(())
}
