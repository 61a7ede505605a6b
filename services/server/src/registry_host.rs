//! Server half of the registry plane: named value cells with push.

use crate::state::AppState;
use hub_protocol::{Envelope, RegistryUpdate, event_keys};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

pub struct RegistryHost {
    values: Mutex<HashMap<String, Value>>,
    /// registry key -> subscribed app keys, in listen order.
    listeners: Mutex<HashMap<String, Vec<String>>>,
}

impl RegistryHost {
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Stores the value and pushes the update to every listener of the key.
    pub async fn update(&self, state: &AppState, payload: RegistryUpdate) {
        self.values
            .lock()
            .await
            .insert(payload.key.clone(), payload.value.clone());

        let subscribers = {
            let listeners = self.listeners.lock().await;
            listeners.get(&payload.key).cloned().unwrap_or_default()
        };
        if subscribers.is_empty() {
            return;
        }
        let data = match serde_json::to_value(&payload) {
            Ok(data) => data,
            Err(error) => {
                warn!(key = %payload.key, %error, "failed to encode registry update");
                return;
            }
        };
        for app_key in subscribers {
            if let Some(session) = state.session(&app_key).await {
                session.send(Envelope::new(event_keys::REGISTRY_UPDATE, data.clone()));
            }
        }
    }

    pub async fn listen(&self, key: &str, app_key: &str) {
        let mut listeners = self.listeners.lock().await;
        let entry = listeners.entry(key.to_owned()).or_default();
        if !entry.iter().any(|existing| existing == app_key) {
            entry.push(app_key.to_owned());
        }
    }

    /// Current value; `Null` when the cell was never written.
    pub async fn get(&self, key: &str) -> Value {
        self.values
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or(Value::Null)
    }

    pub async fn detach_session(&self, app_key: &str) {
        let mut listeners = self.listeners.lock().await;
        for subscribers in listeners.values_mut() {
            subscribers.retain(|existing| existing != app_key);
        }
    }
}
