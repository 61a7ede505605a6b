//! Server half of the table plane.
//!
//! Each registered [`hub_protocol::TableInfo`] gets a [`HostedTable`]: a
//! store, the subscribed sessions, and the proxy chain.  Add/update batches
//! from sessions enter the proxy chain when proxy sessions exist; only the
//! final transformed batch is committed and fanned out.  Remove/clear
//! commit directly — there are no items for a proxy to transform.
//!
//! Proxy sessions are walked in the order their `table:proxy_listen`
//! arrived; the chain is snapshotted per batch, so sessions joining or
//! leaving mid-flight cannot reorder an in-flight batch.

use crate::state::AppState;
use crate::store::{DbStore, MemoryStore, StoreError, TableStore};
use hub_protocol::{Envelope, TableFetch, TableInfo, TableItems, TableKey, TableKeys, TableProxy,
    event_keys};
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

const DEFAULT_CACHE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Add,
    Update,
}

impl MutationKind {
    fn event_key(self) -> &'static str {
        match self {
            MutationKind::Add => event_keys::TABLE_ITEM_ADD,
            MutationKind::Update => event_keys::TABLE_ITEM_UPDATE,
        }
    }
}

/// A batch travelling through the proxy chain.
struct PendingBatch {
    kind: MutationKind,
    chain: Vec<String>,
    next_hop: usize,
    items: IndexMap<String, Value>,
}

pub struct HostedTable {
    pub info: TableInfo,
    store: Mutex<Box<dyn TableStore>>,
    subscribers: Mutex<Vec<String>>,
    proxies: Mutex<Vec<String>>,
    pending: Mutex<HashMap<u64, PendingBatch>>,
    proxy_seq: AtomicU64,
}

impl HostedTable {
    fn new(info: TableInfo, store: Box<dyn TableStore>) -> Self {
        Self {
            info,
            store: Mutex::new(store),
            subscribers: Mutex::new(Vec::new()),
            proxies: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            proxy_seq: AtomicU64::new(0),
        }
    }

    pub async fn fetch(
        &self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<IndexMap<String, Value>, StoreError> {
        self.store.lock().await.fetch(limit, cursor)
    }

    pub async fn get_items(&self, keys: &[String]) -> Result<IndexMap<String, Value>, StoreError> {
        let mut store = self.store.lock().await;
        let mut items = IndexMap::new();
        for key in keys {
            if let Some(value) = store.get(key)? {
                items.insert(key.clone(), value);
            }
        }
        Ok(items)
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.lock().await.len()
    }

    async fn fan_out(&self, state: &AppState, envelope: Envelope) {
        let subscribers = self.subscribers.lock().await.clone();
        for app_key in subscribers {
            if let Some(session) = state.session(&app_key).await {
                session.send(envelope.clone());
            }
        }
    }

    /// Applies a committed batch to the store and echoes the mutation to
    /// every subscriber.
    async fn commit(
        &self,
        state: &AppState,
        kind: MutationKind,
        key: &str,
        items: IndexMap<String, Value>,
    ) {
        if items.is_empty() {
            return;
        }
        // The store guard is held through the fan-out so that the echoed
        // event order always matches the store's mutation order.
        let mut store = self.store.lock().await;
        if let Err(error) = store.set_many(&items) {
            warn!(table = %key, %error, "table write failed");
            return;
        }
        let payload = TableItems {
            table: key.to_owned(),
            items,
        };
        match serde_json::to_value(&payload) {
            Ok(data) => {
                self.fan_out(state, Envelope::new(kind.event_key(), data))
                    .await;
            }
            Err(error) => warn!(table = %key, %error, "failed to encode mutation event"),
        }
    }

    /// Sends the batch to the next live proxy session, committing when the
    /// chain is exhausted.  Dead hops are skipped.
    async fn advance(&self, state: &AppState, table_key: &str, batch_key: u64) {
        loop {
            let (hop, items) = {
                let mut pending = self.pending.lock().await;
                let Some(batch) = pending.get_mut(&batch_key) else {
                    return;
                };
                if batch.next_hop >= batch.chain.len() {
                    if let Some(done) = pending.remove(&batch_key) {
                        drop(pending);
                        self.commit(state, done.kind, table_key, done.items).await;
                    }
                    return;
                }
                let hop = batch.chain[batch.next_hop].clone();
                (hop, batch.items.clone())
            };

            match state.session(&hop).await {
                Some(session) => {
                    let payload = TableProxy {
                        table: table_key.to_owned(),
                        key: batch_key,
                        items,
                    };
                    match serde_json::to_value(&payload) {
                        Ok(data) => {
                            session.send(Envelope::new(event_keys::TABLE_PROXY, data));
                        }
                        Err(error) => {
                            warn!(table = %table_key, %error, "failed to encode proxy event");
                        }
                    }
                    return;
                }
                None => {
                    // Proxy session is gone; treat the hop as identity.
                    let mut pending = self.pending.lock().await;
                    if let Some(batch) = pending.get_mut(&batch_key) {
                        batch.next_hop += 1;
                    }
                }
            }
        }
    }
}

pub struct TableHost {
    tables: RwLock<HashMap<String, Arc<HostedTable>>>,
}

impl TableHost {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    /// Creates the hosted table on first registration.  Re-registration
    /// keeps the existing store.
    pub async fn ensure(
        &self,
        info: TableInfo,
        data_root: Option<&Path>,
    ) -> Result<Arc<HostedTable>, StoreError> {
        let key = info.key();
        {
            let tables = self.tables.read().await;
            if let Some(table) = tables.get(&key) {
                return Ok(Arc::clone(table));
            }
        }
        let mut tables = self.tables.write().await;
        if let Some(table) = tables.get(&key) {
            return Ok(Arc::clone(table));
        }

        let use_cache = info.cache.unwrap_or(false);
        let cache_size = info.cache_size.unwrap_or(DEFAULT_CACHE_SIZE);
        let store: Box<dyn TableStore> = if info.use_database.unwrap_or(false) {
            match data_root {
                Some(root) => {
                    let path = root.join("tables").join(&key).join("data.db");
                    Box::new(DbStore::open(&path, use_cache, cache_size)?)
                }
                None => {
                    warn!(table = %key, "no data root configured, using in-memory store");
                    Box::new(MemoryStore::new())
                }
            }
        } else {
            Box::new(MemoryStore::new())
        };

        let table = Arc::new(HostedTable::new(info, store));
        tables.insert(key, Arc::clone(&table));
        Ok(table)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<HostedTable>> {
        self.tables.read().await.get(key).cloned()
    }

    /// Tables referenced before any `table:register` get a default
    /// in-memory descriptor.
    async fn ensure_default(&self, state: &AppState, key: &str) -> Option<Arc<HostedTable>> {
        if let Some(table) = self.get(key).await {
            return Some(table);
        }
        let info = match key.split_once(':') {
            Some((extension, name)) => TableInfo::new(extension, name),
            None => TableInfo::new(key, ""),
        };
        match self.ensure(info, state.data_root.as_deref()).await {
            Ok(table) => Some(table),
            Err(error) => {
                warn!(table = %key, %error, "failed to create table");
                None
            }
        }
    }

    pub async fn subscribe(&self, state: &AppState, key: &str, app_key: &str) {
        let Some(table) = self.ensure_default(state, key).await else {
            return;
        };
        let mut subscribers = table.subscribers.lock().await;
        if !subscribers.iter().any(|existing| existing == app_key) {
            subscribers.push(app_key.to_owned());
        }
    }

    pub async fn add_proxy(&self, state: &AppState, key: &str, app_key: &str) {
        let Some(table) = self.ensure_default(state, key).await else {
            return;
        };
        let mut proxies = table.proxies.lock().await;
        if !proxies.iter().any(|existing| existing == app_key) {
            proxies.push(app_key.to_owned());
        }
    }

    /// Entry point for add/update batches from sessions: straight to the
    /// store, or through the proxy chain when one exists.
    pub async fn submit(&self, state: &AppState, kind: MutationKind, payload: TableItems) {
        let Some(table) = self.ensure_default(state, &payload.table).await else {
            return;
        };
        let chain = table.proxies.lock().await.clone();
        if chain.is_empty() {
            table.commit(state, kind, &payload.table, payload.items).await;
            return;
        }

        let batch_key = table.proxy_seq.fetch_add(1, Ordering::SeqCst) + 1;
        table.pending.lock().await.insert(
            batch_key,
            PendingBatch {
                kind,
                chain,
                next_hop: 0,
                items: payload.items,
            },
        );
        table.advance(state, &payload.table, batch_key).await;
    }

    /// A proxy session returned a transformed batch via the `table:proxy`
    /// endpoint.
    pub async fn proxy_reply(&self, state: &AppState, from_app: &str, payload: TableProxy) {
        let Some(table) = self.get(&payload.table).await else {
            return;
        };
        {
            let mut pending = table.pending.lock().await;
            let Some(batch) = pending.get_mut(&payload.key) else {
                debug!(table = %payload.table, key = payload.key, "proxy reply for unknown batch");
                return;
            };
            let expected = batch.chain.get(batch.next_hop);
            if expected.map(String::as_str) != Some(from_app) {
                warn!(
                    table = %payload.table,
                    key = payload.key,
                    from = %from_app,
                    "proxy reply from unexpected session"
                );
                return;
            }
            batch.items = payload.items;
            batch.next_hop += 1;
        }
        table.advance(state, &payload.table, payload.key).await;
    }

    pub async fn remove_items(&self, state: &AppState, payload: TableItems) {
        let Some(table) = self.ensure_default(state, &payload.table).await else {
            return;
        };
        let keys: Vec<String> = payload.items.keys().cloned().collect();
        let mut store = table.store.lock().await;
        let removed = match store.remove_many(&keys) {
            Ok(removed) => removed,
            Err(error) => {
                warn!(table = %payload.table, %error, "table remove failed");
                return;
            }
        };
        if removed.is_empty() {
            return;
        }
        let echo = TableItems {
            table: payload.table.clone(),
            items: removed,
        };
        match serde_json::to_value(&echo) {
            Ok(data) => {
                table
                    .fan_out(state, Envelope::new(event_keys::TABLE_ITEM_REMOVE, data))
                    .await;
            }
            Err(error) => warn!(table = %payload.table, %error, "failed to encode remove event"),
        }
    }

    pub async fn clear_items(&self, state: &AppState, payload: TableKey) {
        let Some(table) = self.ensure_default(state, &payload.table).await else {
            return;
        };
        let mut store = table.store.lock().await;
        if let Err(error) = store.clear() {
            warn!(table = %payload.table, %error, "table clear failed");
            return;
        }
        match serde_json::to_value(&payload) {
            Ok(data) => {
                table
                    .fan_out(state, Envelope::new(event_keys::TABLE_ITEM_CLEAR, data))
                    .await;
            }
            Err(error) => warn!(table = %payload.table, %error, "failed to encode clear event"),
        }
    }

    /// Endpoint backings.
    pub async fn handle_get(&self, request: TableKeys) -> Result<Value, String> {
        let Some(table) = self.get(&request.table).await else {
            return Ok(empty_items(&request.table));
        };
        let items = table
            .get_items(&request.items)
            .await
            .map_err(|error| error.to_string())?;
        serde_json::to_value(TableItems {
            table: request.table,
            items,
        })
        .map_err(|error| error.to_string())
    }

    pub async fn handle_fetch(&self, request: TableFetch) -> Result<Value, String> {
        let Some(table) = self.get(&request.table).await else {
            return Ok(Value::Object(serde_json::Map::new()));
        };
        let items = table
            .fetch(request.limit, request.cursor.as_deref())
            .await
            .map_err(|error| error.to_string())?;
        serde_json::to_value(items).map_err(|error| error.to_string())
    }

    pub async fn handle_size(&self, request: TableKey) -> Result<Value, String> {
        let Some(table) = self.get(&request.table).await else {
            return Ok(Value::from(0));
        };
        let len = table.len().await.map_err(|error| error.to_string())?;
        Ok(Value::from(len))
    }

    /// Drops a session from every subscriber list and proxy chain, and
    /// advances any batch that was waiting on it.
    pub async fn detach_session(&self, state: &AppState, app_key: &str) {
        let tables: Vec<(String, Arc<HostedTable>)> = {
            let tables = self.tables.read().await;
            tables
                .iter()
                .map(|(key, table)| (key.clone(), Arc::clone(table)))
                .collect()
        };
        for (key, table) in tables {
            table
                .subscribers
                .lock()
                .await
                .retain(|existing| existing != app_key);
            table
                .proxies
                .lock()
                .await
                .retain(|existing| existing != app_key);

            let stalled: Vec<u64> = {
                let mut pending = table.pending.lock().await;
                let mut stalled = Vec::new();
                for (batch_key, batch) in pending.iter_mut() {
                    if batch.chain.get(batch.next_hop).map(String::as_str) == Some(app_key) {
                        batch.next_hop += 1;
                        stalled.push(*batch_key);
                    }
                }
                stalled
            };
            for batch_key in stalled {
                table.advance(state, &key, batch_key).await;
            }
        }
    }
}

fn empty_items(table: &str) -> Value {
    serde_json::to_value(TableItems {
        table: table.to_owned(),
        items: IndexMap::new(),
    })
    .unwrap_or(Value::Null)
}
