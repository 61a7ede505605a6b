//! Shared server state: the session registry plus the three extension
//! hosts (endpoints, tables, registry) and the shutdown signal.

use crate::endpoint_host::EndpointHost;
use crate::registry_host::RegistryHost;
use crate::table_host::TableHost;
use hub_protocol::{App, Envelope, TableInfo};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, watch};
use tracing::warn;
use uuid::Uuid;

/// Handle to one connected session: its identity, the server-assigned
/// session id, and the outbound queue.
#[derive(Clone)]
pub struct SessionHandle {
    pub app: App,
    session_id: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl SessionHandle {
    pub fn new(app: App) -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                app,
                session_id: Uuid::new_v4().to_string(),
                tx,
            },
            rx,
        )
    }

    pub fn app_key(&self) -> String {
        self.app.key()
    }

    /// Server-assigned id, unique per accepted socket.  App keys repeat
    /// across reconnects; session ids never do.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Queues an envelope; drops it (with a log line) when the session's
    /// writer is gone.
    pub fn send(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            warn!(
                app = %self.app.key(),
                session_id = %self.session_id,
                "dropping envelope for closed session"
            );
        }
    }
}

pub struct StateInner {
    pub sessions: RwLock<std::collections::HashMap<String, SessionHandle>>,
    pub endpoints: EndpointHost,
    pub tables: TableHost,
    pub registry: RegistryHost,
    pub data_root: Option<PathBuf>,
    pub shutdown: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

impl std::ops::Deref for AppState {
    type Target = StateInner;

    fn deref(&self) -> &StateInner {
        &self.inner
    }
}

/// Key of the built-in table mirroring the connected apps.
pub const APPS_TABLE: &str = "server:apps";

impl AppState {
    pub fn new(data_root: Option<PathBuf>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(StateInner {
                sessions: RwLock::new(std::collections::HashMap::new()),
                endpoints: EndpointHost::new(),
                tables: TableHost::new(),
                registry: RegistryHost::new(),
                data_root,
                shutdown,
            }),
        }
    }

    /// Creates the built-in tables.  Called once at startup.
    pub async fn init(&self) {
        if let Err(error) = self
            .tables
            .ensure(TableInfo::new("server", "apps"), None)
            .await
        {
            warn!(%error, "failed to create apps table");
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Registers a session under its app key.  Refuses duplicates.
    pub async fn register_session(&self, session: SessionHandle) -> bool {
        let mut sessions = self.sessions.write().await;
        let key = session.app_key();
        if sessions.contains_key(&key) {
            return false;
        }
        sessions.insert(key, session);
        true
    }

    pub async fn session(&self, app_key: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(app_key).cloned()
    }

    /// Removes a session and detaches it from every host.
    pub async fn unregister_session(&self, app_key: &str) {
        self.sessions.write().await.remove(app_key);
        self.tables.detach_session(self, app_key).await;
        self.endpoints.detach_session(self, app_key).await;
        self.registry.detach_session(app_key).await;
    }
}
