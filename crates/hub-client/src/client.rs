//! The hub client: one connection, one event registry, one extension set.
//!
//! On every (re)connect the client announces itself with the `connect`
//! envelope and then replays all outstanding subscriptions in a fixed phase
//! order: owned-table registrations, table listens, proxy listens, registry
//! listens, endpoint advertisements.  Extensions contribute hooks to those
//! phases instead of racing each other on raw connection listeners.

use crate::connection::{Connection, ConnectionListener, LifecycleHook, TransportError};
use crate::endpoint::EndpointExtension;
use crate::event::{EventError, EventRegistry, EventType};
use crate::extension::{ExtensionError, ExtensionRegistry};
use crate::registry::RegistryExtension;
use crate::serializer::{CodecError, Json, Noop};
use crate::table::TableExtension;
use hub_protocol::{Address, App, Envelope, event_keys};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client already running")]
    AlreadyRunning,
    #[error("client not running")]
    NotRunning,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Extension(#[from] ExtensionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Built-in event types.
pub mod events {
    use super::{App, EventType, Json, Noop, Value, event_keys};
    use std::sync::Arc;

    /// First envelope after connecting; carries the client's [`App`].
    pub fn connect() -> EventType<App> {
        EventType::new(event_keys::CONNECT, Arc::new(Json::<App>::new()))
    }

    /// Server acknowledgement of a completed handshake.
    pub fn ready() -> EventType<Value> {
        EventType::new(event_keys::READY, Arc::new(Noop))
    }
}

/// Re-subscription phases, replayed in ascending order on every (re)connect.
pub(crate) mod resubscribe {
    pub const TABLE_REGISTER: u8 = 0;
    pub const TABLE_LISTEN: u8 = 1;
    pub const TABLE_PROXY_LISTEN: u8 = 2;
    pub const REGISTRY_LISTEN: u8 = 3;
    pub const ENDPOINT_REGISTER: u8 = 4;
}

/// Shared innards handed to extensions: identity, connection, events, and
/// the ordered re-subscription hook list.
pub struct ClientCore {
    app: App,
    connection: Arc<Connection>,
    events: Arc<EventRegistry>,
    running: AtomicBool,
    hooks: Mutex<Vec<(u8, u64, LifecycleHook)>>,
    hook_seq: AtomicU64,
}

impl ClientCore {
    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Serializes `item` with the event's codec and sends the envelope.
    pub async fn send<T>(&self, event: &EventType<T>, item: &T) -> Result<(), ClientError> {
        let data = event.serializer().serialize(item)?;
        self.connection
            .send(Envelope::new(event.kind(), data))
            .await?;
        Ok(())
    }

    /// Registers a hook replayed on every (re)connect.  Hooks run in
    /// ascending `(phase, registration)` order.
    pub(crate) async fn add_resubscribe_hook(&self, phase: u8, hook: LifecycleHook) {
        let seq = self.hook_seq.fetch_add(1, Ordering::Relaxed);
        self.hooks.lock().await.push((phase, seq, hook));
    }

    async fn announce_and_resubscribe(&self) {
        if let Err(error) = self.send(&events::connect(), &self.app).await {
            warn!(%error, "failed to announce app after connect");
            return;
        }
        let mut hooks = self.hooks.lock().await.clone();
        hooks.sort_by_key(|(phase, seq, _)| (*phase, *seq));
        for (_, _, hook) in hooks {
            hook().await;
        }
    }
}

/// A connected application: owns the connection and the extension plane for
/// the lifetime of the process.
pub struct Client {
    core: Arc<ClientCore>,
    extensions: Arc<ExtensionRegistry>,
    endpoints: Arc<EndpointExtension>,
    tables: Arc<TableExtension>,
    registry: Arc<RegistryExtension>,
}

impl Client {
    /// Builds a client with the standard extension set.  Does not connect;
    /// call [`Client::start`].
    pub async fn new(app: App, address: Address) -> Result<Self, ClientError> {
        let connection = Connection::new(address);
        let events = Arc::new(EventRegistry::new());
        events.register(&events::connect()).await?;
        events.register(&events::ready()).await?;

        let core = Arc::new(ClientCore {
            app,
            connection: Arc::clone(&connection),
            events: Arc::clone(&events),
            running: AtomicBool::new(false),
            hooks: Mutex::new(Vec::new()),
            hook_seq: AtomicU64::new(0),
        });

        // Every inbound envelope goes through the event registry.
        {
            let events = Arc::clone(&events);
            connection
                .add_listener(ConnectionListener {
                    on_event: Some(Arc::new(move |envelope| {
                        let events = Arc::clone(&events);
                        Box::pin(async move { events.dispatch(envelope).await })
                    })),
                    ..ConnectionListener::default()
                })
                .await;
        }
        // The client itself announces on connect and retries on loss.
        {
            let announce = Arc::downgrade(&core);
            let retry = Arc::downgrade(&core);
            connection
                .add_listener(ConnectionListener {
                    on_connected: Some(Arc::new(move || {
                        let core = announce.clone();
                        Box::pin(async move {
                            if let Some(core) = core.upgrade() {
                                core.announce_and_resubscribe().await;
                            }
                        })
                    })),
                    on_disconnected: Some(Arc::new(move || {
                        let core = retry.clone();
                        Box::pin(async move {
                            if let Some(core) = core.upgrade() {
                                spawn_reconnect(core);
                            }
                        })
                    })),
                    ..ConnectionListener::default()
                })
                .await;
        }

        let extensions = Arc::new(ExtensionRegistry::new(Arc::clone(&core)));
        let endpoints = extensions.register(&EndpointExtension::TYPE).await?;
        let tables = extensions.register(&TableExtension::TYPE).await?;
        let registry = extensions.register(&RegistryExtension::TYPE).await?;

        Ok(Self {
            core,
            extensions,
            endpoints,
            tables,
            registry,
        })
    }

    pub fn app(&self) -> &App {
        self.core.app()
    }

    pub fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    pub fn connection(&self) -> &Arc<Connection> {
        self.core.connection()
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        self.core.events()
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    pub fn endpoints(&self) -> &Arc<EndpointExtension> {
        &self.endpoints
    }

    pub fn tables(&self) -> &Arc<TableExtension> {
        &self.tables
    }

    pub fn registry(&self) -> &Arc<RegistryExtension> {
        &self.registry
    }

    /// Connects and marks the client running.  Errors if already running.
    pub async fn start(&self) -> Result<(), ClientError> {
        if self.core.running.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyRunning);
        }
        info!(app = %self.core.app.key(), "client starting");
        match self.core.connection.connect().await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.core.running.store(false, Ordering::SeqCst);
                Err(error.into())
            }
        }
    }

    /// Disconnects and marks the client stopped.  Errors if not running.
    pub async fn stop(&self) -> Result<(), ClientError> {
        if !self.core.running.swap(false, Ordering::SeqCst) {
            return Err(ClientError::NotRunning);
        }
        self.core.connection.disconnect().await;
        info!(app = %self.core.app.key(), "client stopped");
        Ok(())
    }
}

/// Retry loop after an unexpected loss; gives up once the client stops.
fn spawn_reconnect(core: Arc<ClientCore>) {
    if !core.is_running() {
        return;
    }
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            if !core.is_running() || core.connection.is_connected() {
                return;
            }
            match core.connection.connect().await {
                Ok(()) => return,
                Err(TransportError::AlreadyConnected) => return,
                Err(error) => {
                    warn!(%error, "reconnect attempt failed");
                }
            }
        }
    });
}
