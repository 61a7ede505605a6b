//! Table storage back-ends.
//!
//! A [`TableStore`] is an ordered key/value map with exclusive-cursor
//! pagination: `fetch(limit, cursor)` returns up to `limit` entries whose
//! keys follow `cursor`, and an empty page once the key space is exhausted.
//! Updating an existing key keeps its position; insertion order is the only
//! order.
//!
//! Two back-ends: `MemoryStore` (plain ordered map) and `DbStore` (SQLite
//! file, one per table, with an optional bounded read-through cache that
//! evicts its oldest entry when full).

use indexmap::IndexMap;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub trait TableStore: Send {
    fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError>;
    /// Insert or update; existing keys keep their position.
    fn set_many(&mut self, items: &IndexMap<String, Value>) -> Result<(), StoreError>;
    /// Returns the entries that actually existed, in store order.
    fn remove_many(&mut self, keys: &[String]) -> Result<IndexMap<String, Value>, StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;
    fn fetch(
        &mut self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<IndexMap<String, Value>, StoreError>;
    fn len(&mut self) -> Result<usize, StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryStore {
    items: IndexMap<String, Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TableStore for MemoryStore {
    fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.items.get(key).cloned())
    }

    fn set_many(&mut self, items: &IndexMap<String, Value>) -> Result<(), StoreError> {
        for (key, value) in items {
            self.items.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn remove_many(&mut self, keys: &[String]) -> Result<IndexMap<String, Value>, StoreError> {
        let mut removed = IndexMap::new();
        for key in keys {
            if let Some(value) = self.items.shift_remove(key) {
                removed.insert(key.clone(), value);
            }
        }
        Ok(removed)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.items.clear();
        Ok(())
    }

    fn fetch(
        &mut self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<IndexMap<String, Value>, StoreError> {
        let start = match cursor {
            None => 0,
            Some(cursor) => match self.items.get_index_of(cursor) {
                Some(index) => index + 1,
                // A stale cursor (key since removed) terminates pagination.
                None => return Ok(IndexMap::new()),
            },
        };
        Ok(self
            .items
            .iter()
            .skip(start)
            .take(limit)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn len(&mut self) -> Result<usize, StoreError> {
        Ok(self.items.len())
    }
}

// ---------------------------------------------------------------------------
// DbStore
// ---------------------------------------------------------------------------

const SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS items (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    key TEXT NOT NULL UNIQUE,
    value TEXT NOT NULL
)";

/// SQLite-backed store.  `seq` keeps insertion order stable across updates;
/// the cache mirrors the most recently touched entries, bounded by
/// `cache_size` with oldest-first eviction.
pub struct DbStore {
    conn: rusqlite::Connection,
    cache: IndexMap<String, Value>,
    use_cache: bool,
    cache_size: usize,
}

impl DbStore {
    pub fn open(path: &Path, use_cache: bool, cache_size: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = rusqlite::Connection::open(path)?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            cache: IndexMap::new(),
            use_cache,
            cache_size,
        })
    }

    #[cfg(test)]
    fn open_in_memory(use_cache: bool, cache_size: usize) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            cache: IndexMap::new(),
            use_cache,
            cache_size,
        })
    }

    fn cache_put(&mut self, key: &str, value: &Value) {
        if !self.use_cache {
            return;
        }
        self.cache.insert(key.to_owned(), value.clone());
        while self.cache.len() > self.cache_size {
            self.cache.shift_remove_index(0);
        }
    }

    #[cfg(test)]
    fn cached_keys(&self) -> Vec<String> {
        self.cache.keys().cloned().collect()
    }
}

impl TableStore for DbStore {
    fn get(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        if let Some(hit) = self.cache.get(key) {
            return Ok(Some(hit.clone()));
        }
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM items WHERE key = ?1")?;
        let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
        let Some(text) = rows.next().transpose()? else {
            return Ok(None);
        };
        drop(rows);
        drop(stmt);
        let value: Value = serde_json::from_str(&text)?;
        self.cache_put(key, &value);
        Ok(Some(value))
    }

    fn set_many(&mut self, items: &IndexMap<String, Value>) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        for (key, value) in items {
            tx.execute(
                "INSERT INTO items (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, serde_json::to_string(value)?],
            )?;
        }
        tx.commit()?;
        for (key, value) in items {
            self.cache_put(key, value);
        }
        Ok(())
    }

    fn remove_many(&mut self, keys: &[String]) -> Result<IndexMap<String, Value>, StoreError> {
        let mut removed = IndexMap::new();
        for key in keys {
            let mut stmt = self
                .conn
                .prepare("SELECT value FROM items WHERE key = ?1")?;
            let mut rows = stmt.query_map([key], |row| row.get::<_, String>(0))?;
            let existing = rows.next().transpose()?;
            drop(rows);
            drop(stmt);
            if let Some(text) = existing {
                self.conn
                    .execute("DELETE FROM items WHERE key = ?1", [key])?;
                removed.insert(key.clone(), serde_json::from_str(&text)?);
            }
            self.cache.shift_remove(key);
        }
        Ok(removed)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("DELETE FROM items")?;
        self.cache.clear();
        Ok(())
    }

    fn fetch(
        &mut self,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<IndexMap<String, Value>, StoreError> {
        let rows: Vec<(String, String)> = match cursor {
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT key, value FROM items ORDER BY seq LIMIT ?1")?;
                let rows = stmt.query_map([limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            Some(cursor) => {
                let mut stmt = self.conn.prepare("SELECT seq FROM items WHERE key = ?1")?;
                let mut seqs = stmt.query_map([cursor], |row| row.get::<_, i64>(0))?;
                let Some(cursor_seq) = seqs.next().transpose()? else {
                    return Ok(IndexMap::new());
                };
                drop(seqs);
                drop(stmt);
                let mut stmt = self.conn.prepare(
                    "SELECT key, value FROM items WHERE seq > ?1 ORDER BY seq LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![cursor_seq, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        let mut items = IndexMap::with_capacity(rows.len());
        for (key, text) in rows {
            let value: Value = serde_json::from_str(&text)?;
            self.cache_put(&key, &value);
            items.insert(key, value);
        }
        Ok(items)
    }

    fn len(&mut self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}
