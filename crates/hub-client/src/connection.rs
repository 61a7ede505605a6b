//! Persistent bidirectional envelope channel over a WebSocket.
//!
//! One writer task drains an mpsc queue into the socket (FIFO per caller),
//! one reader task parses inbound text frames into envelopes and hands them
//! to the listeners sequentially.  The connection never reconnects by
//! itself; on loss it surfaces `on_disconnected` and leaves the retry
//! decision to the owner.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use hub_protocol::{Address, Envelope};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("already connected")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("connect to {url}: {message}")]
    Connect { url: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => f.write_str("connected"),
            ConnectionStatus::Disconnected => f.write_str("disconnected"),
        }
    }
}

pub type LifecycleHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type EnvelopeHook = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;
pub type StatusHook = Arc<dyn Fn(ConnectionStatus) -> BoxFuture<'static, ()> + Send + Sync>;

/// Connection listener: a record of optional callback slots.
/// An empty slot means "not interested".
#[derive(Default, Clone)]
pub struct ConnectionListener {
    pub on_connected: Option<LifecycleHook>,
    pub on_disconnected: Option<LifecycleHook>,
    pub on_event: Option<EnvelopeHook>,
    pub on_status_changed: Option<StatusHook>,
}

pub struct Connection {
    address: Address,
    listeners: Mutex<Vec<(u64, ConnectionListener)>>,
    next_listener: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    status: watch::Sender<ConnectionStatus>,
    /// Bumped on every connect/disconnect so a superseded reader task
    /// cannot emit a stale disconnect notification.
    epoch: AtomicU64,
    /// Handle to ourselves for the spawned reader task.
    self_ref: std::sync::Weak<Connection>,
}

impl Connection {
    pub fn new(address: Address) -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Arc::new_cyclic(|self_ref| Self {
            address,
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            outbound: Mutex::new(None),
            status,
            epoch: AtomicU64::new(0),
            self_ref: self_ref.clone(),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionStatus::Connected
    }

    /// Watch handle for status transitions.
    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    pub async fn add_listener(&self, listener: ConnectionListener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().await.push((id, listener));
        id
    }

    pub async fn remove_listener(&self, id: u64) {
        self.listeners.lock().await.retain(|(lid, _)| *lid != id);
    }

    /// Opens the channel.  Errors if already open.
    ///
    /// Listeners are notified (`on_connected`, then
    /// `on_status_changed(connected)`, per listener in registration order)
    /// before this returns.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.is_connected() {
            return Err(TransportError::AlreadyConnected);
        }

        let url = self.address.ws_url();
        let (ws, _response) =
            connect_async(url.as_str())
                .await
                .map_err(|error| TransportError::Connect {
                    url: url.clone(),
                    message: error.to_string(),
                })?;
        let (mut sink, stream) = ws.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, kind = %envelope.kind, "failed to encode envelope");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.outbound.lock().await = Some(tx);
        self.status.send_replace(ConnectionStatus::Connected);

        if let Some(conn) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                conn.read_loop(stream, epoch).await;
            });
        }

        debug!(%url, "connection established");
        for (_, listener) in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_connected {
                hook().await;
            }
            if let Some(hook) = &listener.on_status_changed {
                hook(ConnectionStatus::Connected).await;
            }
        }
        Ok(())
    }

    /// Closes the channel.  Idempotent.
    pub async fn disconnect(&self) {
        let tx = self.outbound.lock().await.take();
        if tx.is_none() {
            return;
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.finish_disconnect().await;
    }

    /// Enqueues an envelope for transmission.  Errors if not connected.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let tx = self
            .outbound
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        tx.send(envelope).map_err(|_| TransportError::NotConnected)
    }

    async fn read_loop<S>(self: Arc<Self>, mut stream: S, epoch: u64)
    where
        S: futures_util::Stream<
                Item = Result<Message, tokio_tungstenite::tungstenite::Error>,
            > + Unpin,
    {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                    Ok(envelope) => self.deliver(envelope).await,
                    Err(error) => warn!(%error, "dropping malformed envelope"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(error) => {
                    debug!(%error, "connection read failed");
                    break;
                }
            }
        }
        // A newer connect (or an explicit disconnect) already owns the
        // notification; only the current epoch reports the loss.
        if self.epoch.load(Ordering::SeqCst) == epoch {
            self.outbound.lock().await.take();
            self.finish_disconnect().await;
        }
    }

    async fn deliver(&self, envelope: Envelope) {
        for (_, listener) in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_event {
                hook(envelope.clone()).await;
            }
        }
    }

    async fn finish_disconnect(&self) {
        let previous = self.status.send_replace(ConnectionStatus::Disconnected);
        if previous == ConnectionStatus::Disconnected {
            return;
        }
        for (_, listener) in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_disconnected {
                hook().await;
            }
            if let Some(hook) = &listener.on_status_changed {
                hook(ConnectionStatus::Disconnected).await;
            }
        }
    }

    async fn snapshot_listeners(&self) -> Vec<(u64, ConnectionListener)> {
        self.listeners.lock().await.clone()
    }
}
