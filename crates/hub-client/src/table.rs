//! Replicated keyed tables.
//!
//! A [`Table`] is a client-side view of a server-hosted ordered collection.
//! Mutations are fire-and-forget events; the cache is updated only by the
//! echoed mutation stream, so every subscribed client replays the exact
//! server-authoritative order.  Reads go through the `table:item_get`,
//! `table:item_fetch` and `table:item_size` endpoints.
//!
//! Write proxies intercept batches before the server commits them: the
//! server pushes `table:proxy`, the client runs its proxy pipeline over the
//! items and answers through the `table:proxy` endpoint.

use crate::client::{ClientCore, ClientError, resubscribe};
use crate::endpoint::{EndpointCallError, EndpointExtension, EndpointType};
use crate::event::EventType;
use crate::extension::{ExtensionContext, ExtensionType};
use crate::serializer::{CodecError, Json, Serializer};
use futures_util::Stream;
use futures_util::future::BoxFuture;
use hub_protocol::{
    EndpointInfo, TableFetch, TableInfo, TableItems, TableKey, TableKeys, TableProxy, event_keys,
};
use indexmap::IndexMap;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Error)]
pub enum TableError {
    #[error("table {0} already registered")]
    AlreadyRegistered(String),
    #[error("table {0} registered with a different item type")]
    TypeMismatch(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Call(#[from] EndpointCallError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Items stored in tables address themselves.
pub trait Keyable {
    fn key(&self) -> String;
}

/// Table descriptor plus the item codec.
pub struct TableType<T> {
    info: TableInfo,
    serializer: Arc<dyn Serializer<T>>,
}

impl<T> TableType<T> {
    pub fn new(info: TableInfo, serializer: Arc<dyn Serializer<T>>) -> Self {
        Self { info, serializer }
    }

    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    pub fn key(&self) -> String {
        self.info.key()
    }
}

impl<T> Clone for TableType<T> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            serializer: Arc::clone(&self.serializer),
        }
    }
}

pub type ItemsHook<T> = Arc<dyn Fn(IndexMap<String, T>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ClearHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;
pub type ProxyFn<T> = Arc<dyn Fn(T) -> Option<T> + Send + Sync>;

/// Table listener: a record of optional callback slots, invoked in listener
/// registration order.  An empty slot means "not interested".
pub struct TableListener<T> {
    pub on_add: Option<ItemsHook<T>>,
    pub on_update: Option<ItemsHook<T>>,
    pub on_remove: Option<ItemsHook<T>>,
    pub on_clear: Option<ClearHook>,
    pub on_cache_update: Option<ItemsHook<T>>,
}

impl<T> Default for TableListener<T> {
    fn default() -> Self {
        Self {
            on_add: None,
            on_update: None,
            on_remove: None,
            on_clear: None,
            on_cache_update: None,
        }
    }
}

impl<T> Clone for TableListener<T> {
    fn clone(&self) -> Self {
        Self {
            on_add: self.on_add.clone(),
            on_update: self.on_update.clone(),
            on_remove: self.on_remove.clone(),
            on_clear: self.on_clear.clone(),
            on_cache_update: self.on_cache_update.clone(),
        }
    }
}

fn add_event() -> EventType<TableItems> {
    EventType::new(event_keys::TABLE_ITEM_ADD, Arc::new(Json::new()))
}

fn update_event() -> EventType<TableItems> {
    EventType::new(event_keys::TABLE_ITEM_UPDATE, Arc::new(Json::new()))
}

fn remove_event() -> EventType<TableItems> {
    EventType::new(event_keys::TABLE_ITEM_REMOVE, Arc::new(Json::new()))
}

fn clear_event() -> EventType<TableKey> {
    EventType::new(event_keys::TABLE_ITEM_CLEAR, Arc::new(Json::new()))
}

fn proxy_event() -> EventType<TableProxy> {
    EventType::new(event_keys::TABLE_PROXY, Arc::new(Json::new()))
}

fn register_event() -> EventType<TableInfo> {
    EventType::new(event_keys::TABLE_REGISTER, Arc::new(Json::new()))
}

fn listen_event() -> EventType<TableKey> {
    EventType::new(event_keys::TABLE_LISTEN, Arc::new(Json::new()))
}

fn proxy_listen_event() -> EventType<TableKey> {
    EventType::new(event_keys::TABLE_PROXY_LISTEN, Arc::new(Json::new()))
}

fn item_get_endpoint() -> EndpointType<TableKeys, TableItems> {
    EndpointType::new(
        EndpointInfo::new("table", "item_get"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    )
}

fn item_fetch_endpoint() -> EndpointType<TableFetch, IndexMap<String, Value>> {
    EndpointType::new(
        EndpointInfo::new("table", "item_fetch"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    )
}

fn item_size_endpoint() -> EndpointType<TableKey, usize> {
    EndpointType::new(
        EndpointInfo::new("table", "item_size"),
        Arc::new(Json::new()),
        Arc::new(Json::new()),
    )
}

struct TableInner<T> {
    core: Arc<ClientCore>,
    endpoints: Arc<EndpointExtension>,
    info: TableInfo,
    key: String,
    serializer: Arc<dyn Serializer<T>>,
    cache: Mutex<IndexMap<String, T>>,
    listeners: Mutex<Vec<(u64, TableListener<T>)>>,
    proxies: Mutex<Vec<(u64, ProxyFn<T>)>>,
    next_id: AtomicU64,
    listening: AtomicBool,
    owned: bool,
}

/// A handle to one replicated table; cheap to clone, all clones share the
/// same cache and listener list.
pub struct Table<T> {
    inner: Arc<TableInner<T>>,
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Table<T>
where
    T: Keyable + Clone + Send + Sync + 'static,
{
    pub fn info(&self) -> &TableInfo {
        &self.inner.info
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Snapshot of the local cache in insertion order.
    pub async fn cache(&self) -> IndexMap<String, T> {
        self.inner.cache.lock().await.clone()
    }

    /// Cache hit, or a `table:item_get` round trip.
    pub async fn get(&self, key: &str) -> Result<Option<T>, TableError> {
        if let Some(hit) = self.inner.cache.lock().await.get(key) {
            return Ok(Some(hit.clone()));
        }
        let response = self
            .inner
            .endpoints
            .invoke(
                &item_get_endpoint(),
                &TableKeys {
                    table: self.inner.key.clone(),
                    items: vec![key.to_owned()],
                },
            )
            .await?;
        let items = self.inner.parse_items(&response.items)?;
        self.inner.merge(items.clone()).await;
        Ok(items.get(key).cloned())
    }

    /// Sends an `item_add` batch.  The local cache is updated by the echoed
    /// mutation event, not by this call.
    pub async fn add(&self, items: &[T]) -> Result<(), TableError> {
        self.inner.send_items(&add_event(), items).await
    }

    /// Sends an `item_update` batch.
    pub async fn set(&self, items: &[T]) -> Result<(), TableError> {
        self.inner.send_items(&update_event(), items).await
    }

    /// Sends an `item_remove` batch.
    pub async fn remove(&self, items: &[T]) -> Result<(), TableError> {
        self.inner.send_items(&remove_event(), items).await
    }

    pub async fn clear(&self) -> Result<(), TableError> {
        let payload = TableKey {
            table: self.inner.key.clone(),
        };
        self.inner.core.send(&clear_event(), &payload).await?;
        Ok(())
    }

    /// Fetches one page in server order, merging it into the cache.
    pub async fn fetch(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<IndexMap<String, T>, TableError> {
        self.inner.fetch_into_cache(limit, cursor).await
    }

    /// Lazy pass over all items: pages of 100 until the server runs dry.
    /// Finite and not restartable.
    pub fn iter(&self) -> impl Stream<Item = Result<T, TableError>> + Send + 'static {
        let table = self.clone();
        async_stream::try_stream! {
            let mut cursor: Option<String> = None;
            loop {
                let page = table.fetch(100, cursor.clone()).await?;
                let page_len = page.len();
                if page_len == 0 {
                    break;
                }
                cursor = page.keys().next_back().cloned();
                for (_, item) in page {
                    yield item;
                }
                if page_len < 100 {
                    break;
                }
            }
        }
    }

    pub async fn size(&self) -> Result<usize, TableError> {
        let payload = TableKey {
            table: self.inner.key.clone(),
        };
        Ok(self
            .inner
            .endpoints
            .invoke(&item_size_endpoint(), &payload)
            .await?)
    }

    /// Appends a listener and marks the table listening.
    pub async fn add_listener(&self, listener: TableListener<T>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().await.push((id, listener));
        let newly_listening = !self.inner.listening.swap(true, Ordering::SeqCst);
        if newly_listening && self.inner.core.connection().is_connected() {
            self.inner.send_listen().await;
        }
        id
    }

    /// Removes a listener.  The table stays marked listening.
    pub async fn remove_listener(&self, id: u64) {
        self.inner.listeners.lock().await.retain(|(lid, _)| *lid != id);
    }

    /// Convenience: listen for cache updates only.
    pub async fn listen<F, Fut>(&self, callback: F) -> u64
    where
        F: Fn(IndexMap<String, T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: ItemsHook<T> = Arc::new(move |cache| Box::pin(callback(cache)));
        self.add_listener(TableListener {
            on_cache_update: Some(callback),
            ..TableListener::default()
        })
        .await
    }

    /// Appends a stage to the write-proxy pipeline.
    pub async fn proxy(&self, stage: impl Fn(T) -> Option<T> + Send + Sync + 'static) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let first = {
            let mut proxies = self.inner.proxies.lock().await;
            let first = proxies.is_empty();
            proxies.push((id, Arc::new(stage)));
            first
        };
        if first && self.inner.core.connection().is_connected() {
            self.inner.send_proxy_listen().await;
        }
        id
    }

    pub async fn remove_proxy(&self, id: u64) {
        self.inner.proxies.lock().await.retain(|(pid, _)| *pid != id);
    }
}

impl<T> TableInner<T>
where
    T: Keyable + Clone + Send + Sync + 'static,
{
    fn parse_items(&self, items: &IndexMap<String, Value>) -> Result<IndexMap<String, T>, TableError> {
        let mut parsed = IndexMap::with_capacity(items.len());
        for (key, value) in items {
            let item = self.serializer.deserialize(value.clone())?;
            parsed.insert(key.clone(), item);
        }
        Ok(parsed)
    }

    fn build_items(&self, items: &[T]) -> Result<TableItems, TableError> {
        let mut wire = IndexMap::with_capacity(items.len());
        for item in items {
            wire.insert(item.key(), self.serializer.serialize(item)?);
        }
        Ok(TableItems {
            table: self.key.clone(),
            items: wire,
        })
    }

    async fn send_items(
        &self,
        event: &EventType<TableItems>,
        items: &[T],
    ) -> Result<(), TableError> {
        let payload = self.build_items(items)?;
        self.core.send(event, &payload).await?;
        Ok(())
    }

    async fn merge(&self, items: IndexMap<String, T>) {
        self.cache.lock().await.extend(items);
    }

    async fn fetch_into_cache(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<IndexMap<String, T>, TableError> {
        let page = self
            .endpoints
            .invoke(
                &item_fetch_endpoint(),
                &TableFetch {
                    table: self.key.clone(),
                    limit,
                    cursor,
                },
            )
            .await?;
        let items = self.parse_items(&page)?;
        self.merge(items.clone()).await;
        let cache = self.cache.lock().await.clone();
        self.notify_cache_update(cache).await;
        Ok(items)
    }

    async fn snapshot_listeners(&self) -> Vec<TableListener<T>> {
        self.listeners
            .lock()
            .await
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect()
    }

    async fn notify_cache_update(&self, cache: IndexMap<String, T>) {
        for listener in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_cache_update {
                hook(cache.clone()).await;
            }
        }
    }

    async fn handle_add(&self, payload: TableItems) {
        if payload.table != self.key {
            return;
        }
        let items = match self.parse_items(&payload.items) {
            Ok(items) => items,
            Err(error) => {
                warn!(table = %self.key, %error, "rejecting add batch");
                return;
            }
        };
        let cache = {
            let mut cache = self.cache.lock().await;
            cache.extend(items.clone());
            cache.clone()
        };
        for listener in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_add {
                hook(items.clone()).await;
            }
            if let Some(hook) = &listener.on_cache_update {
                hook(cache.clone()).await;
            }
        }
    }

    async fn handle_update(&self, payload: TableItems) {
        if payload.table != self.key {
            return;
        }
        let items = match self.parse_items(&payload.items) {
            Ok(items) => items,
            Err(error) => {
                warn!(table = %self.key, %error, "rejecting update batch");
                return;
            }
        };
        let cache = {
            let mut cache = self.cache.lock().await;
            cache.extend(items.clone());
            cache.clone()
        };
        for listener in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_update {
                hook(items.clone()).await;
            }
            if let Some(hook) = &listener.on_cache_update {
                hook(cache.clone()).await;
            }
        }
    }

    async fn handle_remove(&self, payload: TableItems) {
        if payload.table != self.key {
            return;
        }
        let items = match self.parse_items(&payload.items) {
            Ok(items) => items,
            Err(error) => {
                warn!(table = %self.key, %error, "rejecting remove batch");
                return;
            }
        };
        let cache = {
            let mut cache = self.cache.lock().await;
            for key in items.keys() {
                cache.shift_remove(key);
            }
            cache.clone()
        };
        for listener in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_remove {
                hook(items.clone()).await;
            }
            if let Some(hook) = &listener.on_cache_update {
                hook(cache.clone()).await;
            }
        }
    }

    async fn handle_clear(&self, payload: TableKey) {
        if payload.table != self.key {
            return;
        }
        self.cache.lock().await.clear();
        for listener in self.snapshot_listeners().await {
            if let Some(hook) = &listener.on_clear {
                hook().await;
            }
            if let Some(hook) = &listener.on_cache_update {
                hook(IndexMap::new()).await;
            }
        }
    }

    /// Runs the proxy pipeline over a server-pushed batch and returns the
    /// transformed items through the `table:proxy` endpoint.
    async fn handle_proxy(&self, payload: TableProxy) {
        if payload.table != self.key {
            return;
        }
        let mut items = match self.parse_items(&payload.items) {
            Ok(items) => items,
            Err(error) => {
                warn!(table = %self.key, %error, "rejecting proxy batch");
                return;
            }
        };
        let proxies: Vec<ProxyFn<T>> = self
            .proxies
            .lock()
            .await
            .iter()
            .map(|(_, stage)| Arc::clone(stage))
            .collect();
        for stage in &proxies {
            let mut next = IndexMap::with_capacity(items.len());
            for (key, item) in items {
                if let Some(replacement) = stage(item) {
                    next.insert(key, replacement);
                }
            }
            items = next;
        }

        let mut wire = IndexMap::with_capacity(items.len());
        for (key, item) in &items {
            match self.serializer.serialize(item) {
                Ok(value) => {
                    wire.insert(key.clone(), value);
                }
                Err(error) => {
                    warn!(table = %self.key, %error, "failed to encode proxy batch");
                    return;
                }
            }
        }
        let reply = TableProxy {
            table: self.key.clone(),
            key: payload.key,
            items: wire,
        };
        let data = match serde_json::to_value(&reply) {
            Ok(data) => data,
            Err(error) => {
                warn!(table = %self.key, %error, "failed to encode proxy reply");
                return;
            }
        };
        // The ack is fire-and-forget: this runs on the dispatch path, and
        // awaiting the reply here would block the very loop that delivers it.
        match self
            .endpoints
            .execute(hub_protocol::endpoint_keys::TABLE_PROXY, data)
            .await
        {
            Ok(_handle) => {}
            Err(error) => warn!(table = %self.key, %error, "failed to send proxy reply"),
        }
    }

    async fn send_listen(&self) {
        let payload = TableKey {
            table: self.key.clone(),
        };
        if let Err(error) = self.core.send(&listen_event(), &payload).await {
            warn!(table = %self.key, %error, "failed to send table listen");
            return;
        }
        if let Some(limit) = self.info.cache_size
            && let Err(error) = self.fetch_into_cache(limit, None).await
        {
            warn!(table = %self.key, %error, "failed to prime table cache");
        }
    }

    async fn send_proxy_listen(&self) {
        let payload = TableKey {
            table: self.key.clone(),
        };
        if let Err(error) = self.core.send(&proxy_listen_event(), &payload).await {
            warn!(table = %self.key, %error, "failed to send proxy listen");
        }
    }

    async fn send_register(&self) {
        if let Err(error) = self.core.send(&register_event(), &self.info).await {
            warn!(table = %self.key, %error, "failed to register table");
        }
    }
}

pub struct TableExtension {
    core: Arc<ClientCore>,
    endpoints: Arc<EndpointExtension>,
    tables: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl TableExtension {
    pub const TYPE: ExtensionType<TableExtension> = ExtensionType {
        key: "table",
        dependencies: &["endpoint"],
        create: create_extension,
    };

    async fn create(context: ExtensionContext) -> Result<Arc<Self>, ClientError> {
        let core = Arc::clone(context.core());
        let endpoints = context
            .extension(&EndpointExtension::TYPE)
            .await
            .map_err(ClientError::from)?;

        let events = core.events();
        events.register(&add_event()).await?;
        events.register(&update_event()).await?;
        events.register(&remove_event()).await?;
        events.register(&clear_event()).await?;
        events.register(&proxy_event()).await?;
        events.register(&register_event()).await?;
        events.register(&listen_event()).await?;
        events.register(&proxy_listen_event()).await?;

        Ok(Arc::new(Self {
            core,
            endpoints,
            tables: Mutex::new(HashMap::new()),
        }))
    }

    /// Creates an owned table.  Owned tables re-register their descriptor
    /// with the server on every (re)connect.  Duplicate keys error.
    pub async fn register<T>(&self, ty: &TableType<T>) -> Result<Table<T>, TableError>
    where
        T: Keyable + Clone + Send + Sync + 'static,
    {
        let key = ty.key();
        let mut tables = self.tables.lock().await;
        if tables.contains_key(&key) {
            return Err(TableError::AlreadyRegistered(key));
        }
        let table = self.build(ty, true).await?;
        tables.insert(key, Arc::clone(&table.inner) as Arc<dyn Any + Send + Sync>);
        Ok(table)
    }

    /// Returns the table for a descriptor, creating a non-owned view on
    /// first use.
    pub async fn get<T>(&self, ty: &TableType<T>) -> Result<Table<T>, TableError>
    where
        T: Keyable + Clone + Send + Sync + 'static,
    {
        let key = ty.key();
        let mut tables = self.tables.lock().await;
        if let Some(stored) = tables.get(&key) {
            let inner = Arc::clone(stored)
                .downcast::<TableInner<T>>()
                .map_err(|_| TableError::TypeMismatch(key))?;
            return Ok(Table { inner });
        }
        let table = self.build(ty, false).await?;
        tables.insert(key, Arc::clone(&table.inner) as Arc<dyn Any + Send + Sync>);
        Ok(table)
    }

    async fn build<T>(&self, ty: &TableType<T>, owned: bool) -> Result<Table<T>, TableError>
    where
        T: Keyable + Clone + Send + Sync + 'static,
    {
        let inner = Arc::new(TableInner {
            core: Arc::clone(&self.core),
            endpoints: Arc::clone(&self.endpoints),
            info: ty.info.clone(),
            key: ty.key(),
            serializer: Arc::clone(&ty.serializer),
            cache: Mutex::new(IndexMap::new()),
            listeners: Mutex::new(Vec::new()),
            proxies: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            listening: AtomicBool::new(false),
            owned,
        });

        let events = self.core.events();
        let weak = Arc::downgrade(&inner);
        events
            .add_listener(&add_event(), move |payload: TableItems| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_add(payload).await;
                    }
                }
            })
            .await
            .map_err(ClientError::from)?;
        let weak = Arc::downgrade(&inner);
        events
            .add_listener(&update_event(), move |payload: TableItems| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_update(payload).await;
                    }
                }
            })
            .await
            .map_err(ClientError::from)?;
        let weak = Arc::downgrade(&inner);
        events
            .add_listener(&remove_event(), move |payload: TableItems| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_remove(payload).await;
                    }
                }
            })
            .await
            .map_err(ClientError::from)?;
        let weak = Arc::downgrade(&inner);
        events
            .add_listener(&clear_event(), move |payload: TableKey| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_clear(payload).await;
                    }
                }
            })
            .await
            .map_err(ClientError::from)?;
        let weak = Arc::downgrade(&inner);
        events
            .add_listener(&proxy_event(), move |payload: TableProxy| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_proxy(payload).await;
                    }
                }
            })
            .await
            .map_err(ClientError::from)?;

        let weak = Arc::downgrade(&inner);
        self.core
            .add_resubscribe_hook(
                resubscribe::TABLE_REGISTER,
                Arc::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(inner) = weak.upgrade()
                            && inner.owned
                        {
                            inner.send_register().await;
                        }
                    })
                }),
            )
            .await;
        let weak = Arc::downgrade(&inner);
        self.core
            .add_resubscribe_hook(
                resubscribe::TABLE_LISTEN,
                Arc::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(inner) = weak.upgrade()
                            && inner.listening.load(Ordering::SeqCst)
                        {
                            inner.send_listen().await;
                        }
                    })
                }),
            )
            .await;
        let weak = Arc::downgrade(&inner);
        self.core
            .add_resubscribe_hook(
                resubscribe::TABLE_PROXY_LISTEN,
                Arc::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        if let Some(inner) = weak.upgrade()
                            && !inner.proxies.lock().await.is_empty()
                        {
                            inner.send_proxy_listen().await;
                        }
                    })
                }),
            )
            .await;

        if owned && self.core.connection().is_connected() {
            inner.send_register().await;
        }
        Ok(Table { inner })
    }
}

fn create_extension(
    context: ExtensionContext,
) -> BoxFuture<'static, Result<Arc<TableExtension>, ClientError>> {
    Box::pin(TableExtension::create(context))
}

/// Model-table convenience: serde-backed item codec.
pub fn model_table<T>(info: TableInfo) -> TableType<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    TableType::new(info, Arc::new(Json::<T>::new()))
}

impl Keyable for hub_protocol::App {
    fn key(&self) -> String {
        hub_protocol::App::key(self)
    }
}
