//! Server half of the endpoint plane: routing calls between sessions.
//!
//! Caller keys are only unique per client, so every forwarded call is
//! re-keyed with a server-scoped counter.  The host session answers with
//! the server key; the reply is mapped back to the original (session, key)
//! pair before it goes out to the caller.

use crate::state::AppState;
use hub_protocol::{EndpointCall, EndpointError, EndpointInfo, Envelope, event_keys};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

struct ForwardedCall {
    caller: String,
    caller_key: u64,
    endpoint: String,
    host: String,
}

pub struct EndpointHost {
    /// endpoint key -> (descriptor, hosting app key)
    hosts: RwLock<HashMap<String, (EndpointInfo, String)>>,
    pending: Mutex<HashMap<u64, ForwardedCall>>,
    seq: AtomicU64,
}

impl EndpointHost {
    pub fn new() -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Records an advertised endpoint.  A key already claimed by a
    /// different app is not taken over.
    pub async fn register(&self, info: EndpointInfo, app_key: &str) {
        let key = info.key();
        let mut hosts = self.hosts.write().await;
        if let Some((_, owner)) = hosts.get(&key) {
            if owner != app_key {
                warn!(endpoint = %key, %owner, claimant = %app_key, "endpoint key already claimed");
                return;
            }
        }
        hosts.insert(key, (info, app_key.to_owned()));
    }

    /// Forwards a call from `caller_app` to the hosting session.
    pub async fn route_call(&self, state: &AppState, caller_app: &str, call: EndpointCall) {
        let host_app = {
            let hosts = self.hosts.read().await;
            hosts.get(&call.endpoint).map(|(_, owner)| owner.clone())
        };
        let Some(host_app) = host_app else {
            self.reply_error(state, caller_app, &call, "unknown endpoint")
                .await;
            return;
        };
        let Some(host_session) = state.session(&host_app).await else {
            self.reply_error(state, caller_app, &call, "endpoint host offline")
                .await;
            return;
        };

        let server_key = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.lock().await.insert(
            server_key,
            ForwardedCall {
                caller: caller_app.to_owned(),
                caller_key: call.key,
                endpoint: call.endpoint.clone(),
                host: host_app,
            },
        );
        let forwarded = EndpointCall {
            endpoint: call.endpoint,
            key: server_key,
            data: call.data,
        };
        match serde_json::to_value(forwarded) {
            Ok(data) => host_session.send(Envelope::new(event_keys::ENDPOINT_CALL, data)),
            Err(error) => warn!(%error, "failed to encode forwarded call"),
        }
    }

    /// Maps a host's reply back to the caller.
    pub async fn route_reply(
        &self,
        state: &AppState,
        from_app: &str,
        server_key: u64,
        outcome: Result<Value, String>,
    ) {
        let entry = {
            let mut pending = self.pending.lock().await;
            let from_host = pending.get(&server_key).map(|entry| entry.host == from_app);
            match from_host {
                Some(true) => pending.remove(&server_key),
                Some(false) => {
                    warn!(key = server_key, from = %from_app, "reply from unexpected session");
                    return;
                }
                None => {
                    debug!(key = server_key, "reply for unknown call");
                    return;
                }
            }
        };
        let Some(entry) = entry else {
            return;
        };
        let Some(caller) = state.session(&entry.caller).await else {
            return;
        };

        let envelope = match outcome {
            Ok(data) => {
                let payload = EndpointCall {
                    endpoint: entry.endpoint,
                    key: entry.caller_key,
                    data,
                };
                match serde_json::to_value(payload) {
                    Ok(value) => Envelope::new(event_keys::ENDPOINT_RECEIVE, value),
                    Err(error) => {
                        warn!(%error, "failed to encode reply");
                        return;
                    }
                }
            }
            Err(message) => {
                let payload = EndpointError {
                    endpoint: entry.endpoint,
                    key: entry.caller_key,
                    error: message,
                };
                match serde_json::to_value(payload) {
                    Ok(value) => Envelope::new(event_keys::ENDPOINT_ERROR, value),
                    Err(error) => {
                        warn!(%error, "failed to encode error reply");
                        return;
                    }
                }
            }
        };
        caller.send(envelope);
    }

    /// Session teardown: forget its endpoints, fail calls waiting on it,
    /// and drop calls it issued.
    pub async fn detach_session(&self, state: &AppState, app_key: &str) {
        self.hosts
            .write()
            .await
            .retain(|_, (_, owner)| owner != app_key);

        let orphaned: Vec<ForwardedCall> = {
            let mut pending = self.pending.lock().await;
            let keys: Vec<u64> = pending
                .iter()
                .filter(|(_, entry)| entry.host == app_key || entry.caller == app_key)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key))
                .collect()
        };
        for entry in orphaned {
            if entry.caller == app_key {
                continue;
            }
            let Some(caller) = state.session(&entry.caller).await else {
                continue;
            };
            let payload = EndpointError {
                endpoint: entry.endpoint,
                key: entry.caller_key,
                error: "endpoint host disconnected".to_owned(),
            };
            if let Ok(value) = serde_json::to_value(payload) {
                caller.send(Envelope::new(event_keys::ENDPOINT_ERROR, value));
            }
        }
    }

    async fn reply_error(
        &self,
        state: &AppState,
        caller_app: &str,
        call: &EndpointCall,
        message: &str,
    ) {
        let Some(caller) = state.session(caller_app).await else {
            return;
        };
        let payload = EndpointError {
            endpoint: call.endpoint.clone(),
            key: call.key,
            error: message.to_owned(),
        };
        if let Ok(value) = serde_json::to_value(payload) {
            caller.send(Envelope::new(event_keys::ENDPOINT_ERROR, value));
        }
    }
}
