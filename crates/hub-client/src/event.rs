//! Typed event envelope registry.
//!
//! The registry is the single demultiplexer for inbound envelopes: every
//! event key maps to exactly one [`EventType`], and each entry carries an
//! ordered listener list.  Dispatch deserializes the payload once and then
//! awaits each listener in registration order, so listeners of one event
//! observe a deterministic sequence.
//!
//! Listeners are removed by the id handle returned at registration.

use crate::serializer::Serializer;
use futures_util::future::BoxFuture;
use hub_protocol::Envelope;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::warn;

pub type ListenerId = u64;
pub type EventCallback<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event type {0} already registered")]
    AlreadyRegistered(String),
    #[error("event type {0} not registered")]
    NotRegistered(String),
    #[error("event type {0} registered with a different payload type")]
    TypeMismatch(String),
}

/// A named codec: event key plus the payload serializer.
pub struct EventType<T> {
    kind: String,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> EventType<T> {
    pub fn new(kind: impl Into<String>, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self {
            kind: kind.into(),
            serializer,
        }
    }

    /// Extension-scoped event: `"<extension-key>:<local-name>"`.
    pub fn of_extension(
        extension: &str,
        name: &str,
        serializer: Arc<dyn Serializer<T>>,
    ) -> Self {
        Self::new(format!("{extension}:{name}"), serializer)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer<T>> {
        &self.serializer
    }
}

impl<T> Clone for EventType<T> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

struct Entry<T> {
    serializer: Arc<dyn Serializer<T>>,
    listeners: Mutex<Vec<(ListenerId, EventCallback<T>)>>,
}

/// One registered event key: the typed entry plus its erased dispatcher.
struct Registered {
    typed: Arc<dyn Any + Send + Sync>,
    dispatch: Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>,
}

#[derive(Default)]
pub struct EventRegistry {
    entries: RwLock<HashMap<String, Registered>>,
    next_listener: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an event type under its key.  At most one type per key.
    pub async fn register<T>(&self, event: &EventType<T>) -> Result<(), EventError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let mut entries = self.entries.write().await;
        if entries.contains_key(event.kind()) {
            return Err(EventError::AlreadyRegistered(event.kind().to_owned()));
        }

        let entry = Arc::new(Entry {
            serializer: Arc::clone(event.serializer()),
            listeners: Mutex::new(Vec::new()),
        });
        let dispatch = {
            let entry = Arc::clone(&entry);
            let kind = event.kind().to_owned();
            Arc::new(move |data: Value| -> BoxFuture<'static, ()> {
                let entry = Arc::clone(&entry);
                let kind = kind.clone();
                Box::pin(async move {
                    let item = match entry.serializer.deserialize(data) {
                        Ok(item) => item,
                        Err(error) => {
                            warn!(%kind, %error, "dropping undecodable event payload");
                            return;
                        }
                    };
                    let listeners: Vec<EventCallback<T>> = entry
                        .listeners
                        .lock()
                        .await
                        .iter()
                        .map(|(_, listener)| Arc::clone(listener))
                        .collect();
                    for listener in listeners {
                        listener(item.clone()).await;
                    }
                })
            })
        };

        entries.insert(
            event.kind().to_owned(),
            Registered {
                typed: entry,
                dispatch,
            },
        );
        Ok(())
    }

    /// Appends a listener; the returned id removes it again.
    /// The event type must already be registered.
    pub async fn add_listener<T, F, Fut>(
        &self,
        event: &EventType<T>,
        listener: F,
    ) -> Result<ListenerId, EventError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry = self.typed_entry(event).await?;
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let callback: EventCallback<T> = Arc::new(move |item| Box::pin(listener(item)));
        entry.listeners.lock().await.push((id, callback));
        Ok(id)
    }

    pub async fn remove_listener<T>(
        &self,
        event: &EventType<T>,
        id: ListenerId,
    ) -> Result<(), EventError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entry = self.typed_entry(event).await?;
        entry.listeners.lock().await.retain(|(lid, _)| *lid != id);
        Ok(())
    }

    /// Routes one inbound envelope.  Unknown kinds are logged and dropped.
    pub async fn dispatch(&self, envelope: Envelope) {
        let dispatch = {
            let entries = self.entries.read().await;
            match entries.get(&envelope.kind) {
                Some(registered) => Arc::clone(&registered.dispatch),
                None => {
                    warn!(kind = %envelope.kind, "received unknown event type");
                    return;
                }
            }
        };
        dispatch(envelope.data).await;
    }

    async fn typed_entry<T>(&self, event: &EventType<T>) -> Result<Arc<Entry<T>>, EventError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entries = self.entries.read().await;
        let registered = entries
            .get(event.kind())
            .ok_or_else(|| EventError::NotRegistered(event.kind().to_owned()))?;
        Arc::clone(&registered.typed)
            .downcast::<Entry<T>>()
            .map_err(|_| EventError::TypeMismatch(event.kind().to_owned()))
    }
}
