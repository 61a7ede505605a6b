//! Value <-> wire codecs.
//!
//! A [`Serializer`] converts between a typed value and its JSON wire form.
//! Serializers compose: [`ArrayOf`] and [`MapOf`] lift an item serializer
//! over sequences and string-keyed ordered maps.  All combinators are
//! stateless.

use indexmap::IndexMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid payload: {0}")]
    Invalid(String),
}

/// Bidirectional value/wire codec.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, item: &T) -> Result<Value, CodecError>;
    fn deserialize(&self, data: Value) -> Result<T, CodecError>;
}

/// Identity codec for payloads handled as raw JSON.
pub struct Noop;

impl Serializer<Value> for Noop {
    fn serialize(&self, item: &Value) -> Result<Value, CodecError> {
        Ok(item.clone())
    }

    fn deserialize(&self, data: Value) -> Result<Value, CodecError> {
        Ok(data)
    }
}

/// Serde-derived model codec.
pub struct Json<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Json<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Json<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Serializer<T> for Json<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn serialize(&self, item: &T) -> Result<Value, CodecError> {
        Ok(serde_json::to_value(item)?)
    }

    fn deserialize(&self, data: Value) -> Result<T, CodecError> {
        Ok(serde_json::from_value(data)?)
    }
}

/// Lifts an item codec over a sequence.
pub struct ArrayOf<T> {
    inner: Arc<dyn Serializer<T>>,
}

impl<T> ArrayOf<T> {
    pub fn new(inner: Arc<dyn Serializer<T>>) -> Self {
        Self { inner }
    }
}

impl<T: Send + Sync> Serializer<Vec<T>> for ArrayOf<T> {
    fn serialize(&self, items: &Vec<T>) -> Result<Value, CodecError> {
        let out: Result<Vec<Value>, CodecError> =
            items.iter().map(|item| self.inner.serialize(item)).collect();
        Ok(Value::Array(out?))
    }

    fn deserialize(&self, data: Value) -> Result<Vec<T>, CodecError> {
        let Value::Array(entries) = data else {
            return Err(CodecError::Invalid("expected a JSON array".to_owned()));
        };
        entries
            .into_iter()
            .map(|entry| self.inner.deserialize(entry))
            .collect()
    }
}

/// Lifts an item codec over the values of a string-keyed ordered map.
/// Keys pass through untouched.
pub struct MapOf<T> {
    inner: Arc<dyn Serializer<T>>,
}

impl<T> MapOf<T> {
    pub fn new(inner: Arc<dyn Serializer<T>>) -> Self {
        Self { inner }
    }
}

impl<T: Send + Sync> Serializer<IndexMap<String, T>> for MapOf<T> {
    fn serialize(&self, items: &IndexMap<String, T>) -> Result<Value, CodecError> {
        let mut out = serde_json::Map::new();
        for (key, item) in items {
            out.insert(key.clone(), self.inner.serialize(item)?);
        }
        Ok(Value::Object(out))
    }

    fn deserialize(&self, data: Value) -> Result<IndexMap<String, T>, CodecError> {
        let Value::Object(entries) = data else {
            return Err(CodecError::Invalid("expected a JSON object".to_owned()));
        };
        let mut out = IndexMap::with_capacity(entries.len());
        for (key, entry) in entries {
            let item = self.inner.deserialize(entry)?;
            out.insert(key, item);
        }
        Ok(out)
    }
}
