//! WebSocket session plane.
//!
//! The first frame of every session must be a `connect` envelope carrying
//! the client's [`App`]; a live session with the same app key causes the
//! new socket to be closed.  After the handshake the server replies `ready`
//! and the session joins the `server:apps` table.
//!
//! All subsequent inbound envelopes are dispatched by event key to the
//! extension hosts.  Server-hosted endpoints are answered inline; calls to
//! peer endpoints are routed through [`crate::endpoint_host::EndpointHost`].

use crate::state::{APPS_TABLE, AppState, SessionHandle};
use crate::table_host::MutationKind;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use hub_protocol::{
    App, EndpointCall, EndpointError, EndpointInfo, Envelope, RegistryUpdate, TableFetch,
    TableInfo, TableItems, TableKey, TableKeys, TableProxy, endpoint_keys, event_keys,
};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn recv_text_with_timeout(socket: &mut WebSocket, timeout: Duration) -> Option<String> {
    match tokio::time::timeout(timeout, socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text.to_string()),
        _ => None,
    }
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let Some(text) = recv_text_with_timeout(&mut socket, HANDSHAKE_TIMEOUT).await else {
        debug!("socket closed before handshake");
        return;
    };
    let envelope = match serde_json::from_str::<Envelope>(&text) {
        Ok(envelope) => envelope,
        Err(error) => {
            warn!(%error, "malformed handshake envelope");
            return;
        }
    };
    if envelope.kind != event_keys::CONNECT {
        warn!(kind = %envelope.kind, "first envelope must be connect");
        return;
    }
    let app: App = match serde_json::from_value(envelope.data) {
        Ok(app) => app,
        Err(error) => {
            warn!(%error, "connect envelope carries an invalid app");
            return;
        }
    };

    let app_key = app.key();
    let (session, mut outbound) = SessionHandle::new(app.clone());
    let session_id = session.session_id().to_owned();
    if !state.register_session(session.clone()).await {
        // Closing the socket is the duplicate-key rejection signal.
        warn!(app = %app_key, %session_id, "duplicate app key, rejecting session");
        return;
    }
    info!(app = %app_key, %session_id, "session connected");
    session.send(Envelope::new(event_keys::READY, Value::Null));
    announce_app(&state, &app).await;

    let mut shutdown = state.shutdown_signal();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(envelope) => {
                        let Ok(text) = serde_json::to_string(&envelope) else {
                            continue;
                        };
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    None => break,
                    Some(Err(error)) => {
                        debug!(app = %app_key, %session_id, %error, "session read failed");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(envelope) => dispatch(&state, &session, envelope).await,
                            Err(error) => {
                                warn!(app = %app_key, %error, "dropping malformed envelope");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.unregister_session(&app_key).await;
    withdraw_app(&state, &app).await;
    info!(app = %app_key, %session_id, "session disconnected");
}

/// Joins the built-in apps table; every subscriber sees the arrival.
async fn announce_app(state: &AppState, app: &App) {
    let Ok(value) = serde_json::to_value(app) else {
        return;
    };
    let mut items = IndexMap::new();
    items.insert(app.key(), value);
    state
        .tables
        .submit(
            state,
            MutationKind::Add,
            TableItems {
                table: APPS_TABLE.to_owned(),
                items,
            },
        )
        .await;
}

async fn withdraw_app(state: &AppState, app: &App) {
    let Ok(value) = serde_json::to_value(app) else {
        return;
    };
    let mut items = IndexMap::new();
    items.insert(app.key(), value);
    state
        .tables
        .remove_items(
            state,
            TableItems {
                table: APPS_TABLE.to_owned(),
                items,
            },
        )
        .await;
}

fn parse<T: DeserializeOwned>(envelope: &Envelope) -> Option<T> {
    match serde_json::from_value(envelope.data.clone()) {
        Ok(payload) => Some(payload),
        Err(error) => {
            warn!(kind = %envelope.kind, %error, "dropping undecodable payload");
            None
        }
    }
}

async fn dispatch(state: &AppState, session: &SessionHandle, envelope: Envelope) {
    let app_key = session.app_key();
    match envelope.kind.as_str() {
        event_keys::ENDPOINT_REGISTER => {
            if let Some(info) = parse::<EndpointInfo>(&envelope) {
                state.endpoints.register(info, &app_key).await;
            }
        }
        event_keys::ENDPOINT_CALL => {
            if let Some(call) = parse::<EndpointCall>(&envelope) {
                handle_call(state, session, call).await;
            }
        }
        event_keys::ENDPOINT_RECEIVE => {
            if let Some(reply) = parse::<EndpointCall>(&envelope) {
                state
                    .endpoints
                    .route_reply(state, &app_key, reply.key, Ok(reply.data))
                    .await;
            }
        }
        event_keys::ENDPOINT_ERROR => {
            if let Some(failure) = parse::<EndpointError>(&envelope) {
                state
                    .endpoints
                    .route_reply(state, &app_key, failure.key, Err(failure.error))
                    .await;
            }
        }
        event_keys::TABLE_REGISTER => {
            if let Some(info) = parse::<TableInfo>(&envelope)
                && let Err(error) = state
                    .tables
                    .ensure(info, state.data_root.as_deref())
                    .await
            {
                warn!(app = %app_key, %error, "table registration failed");
            }
        }
        event_keys::TABLE_LISTEN => {
            if let Some(key) = parse::<TableKey>(&envelope) {
                state.tables.subscribe(state, &key.table, &app_key).await;
            }
        }
        event_keys::TABLE_PROXY_LISTEN => {
            if let Some(key) = parse::<TableKey>(&envelope) {
                state.tables.add_proxy(state, &key.table, &app_key).await;
            }
        }
        event_keys::TABLE_ITEM_ADD => {
            if let Some(payload) = parse::<TableItems>(&envelope) {
                state
                    .tables
                    .submit(state, MutationKind::Add, payload)
                    .await;
            }
        }
        event_keys::TABLE_ITEM_UPDATE => {
            if let Some(payload) = parse::<TableItems>(&envelope) {
                state
                    .tables
                    .submit(state, MutationKind::Update, payload)
                    .await;
            }
        }
        event_keys::TABLE_ITEM_REMOVE => {
            if let Some(payload) = parse::<TableItems>(&envelope) {
                state.tables.remove_items(state, payload).await;
            }
        }
        event_keys::TABLE_ITEM_CLEAR => {
            if let Some(payload) = parse::<TableKey>(&envelope) {
                state.tables.clear_items(state, payload).await;
            }
        }
        event_keys::REGISTRY_UPDATE => {
            if let Some(payload) = parse::<RegistryUpdate>(&envelope) {
                state.registry.update(state, payload).await;
            }
        }
        event_keys::REGISTRY_LISTEN => {
            if let Some(key) = parse::<String>(&envelope) {
                state.registry.listen(&key, &app_key).await;
            }
        }
        event_keys::CONNECT | event_keys::READY => {
            debug!(app = %app_key, kind = %envelope.kind, "ignoring handshake event");
        }
        other => {
            debug!(app = %app_key, kind = %other, "ignoring unknown event");
        }
    }
}

async fn handle_call(state: &AppState, session: &SessionHandle, call: EndpointCall) {
    if !is_server_endpoint(&call.endpoint) {
        state
            .endpoints
            .route_call(state, &session.app_key(), call)
            .await;
        return;
    }

    let outcome =
        call_server_endpoint(state, Some(session), &call.endpoint, call.data.clone()).await;
    let envelope = match outcome {
        Ok(data) => {
            let payload = EndpointCall {
                endpoint: call.endpoint,
                key: call.key,
                data,
            };
            match serde_json::to_value(payload) {
                Ok(value) => Envelope::new(event_keys::ENDPOINT_RECEIVE, value),
                Err(error) => {
                    warn!(%error, "failed to encode endpoint reply");
                    return;
                }
            }
        }
        Err(message) => {
            let payload = EndpointError {
                endpoint: call.endpoint,
                key: call.key,
                error: message,
            };
            match serde_json::to_value(payload) {
                Ok(value) => Envelope::new(event_keys::ENDPOINT_ERROR, value),
                Err(error) => {
                    warn!(%error, "failed to encode endpoint error");
                    return;
                }
            }
        }
    };
    session.send(envelope);
}

pub fn is_server_endpoint(key: &str) -> bool {
    matches!(
        key,
        endpoint_keys::TABLE_ITEM_GET
            | endpoint_keys::TABLE_ITEM_FETCH
            | endpoint_keys::TABLE_ITEM_SIZE
            | endpoint_keys::TABLE_PROXY
            | endpoint_keys::REGISTRY_GET
            | endpoint_keys::SERVER_SHUTDOWN
    )
}

fn parse_data<T: DeserializeOwned>(data: Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|error| format!("malformed request: {error}"))
}

/// Dispatches a call to a server-hosted endpoint.  Shared by the event
/// path and the legacy HTTP path; `session` is absent over HTTP, which
/// rules out `table:proxy` there.
pub async fn call_server_endpoint(
    state: &AppState,
    session: Option<&SessionHandle>,
    endpoint: &str,
    data: Value,
) -> Result<Value, String> {
    match endpoint {
        endpoint_keys::TABLE_ITEM_GET => {
            let request: TableKeys = parse_data(data)?;
            state.tables.handle_get(request).await
        }
        endpoint_keys::TABLE_ITEM_FETCH => {
            let request: TableFetch = parse_data(data)?;
            state.tables.handle_fetch(request).await
        }
        endpoint_keys::TABLE_ITEM_SIZE => {
            let request: TableKey = parse_data(data)?;
            state.tables.handle_size(request).await
        }
        endpoint_keys::TABLE_PROXY => {
            let Some(session) = session else {
                return Err("table:proxy requires a connected session".to_owned());
            };
            let request: TableProxy = parse_data(data)?;
            state
                .tables
                .proxy_reply(state, &session.app_key(), request)
                .await;
            Ok(Value::Null)
        }
        endpoint_keys::REGISTRY_GET => {
            let key: String = parse_data(data)?;
            Ok(state.registry.get(&key).await)
        }
        endpoint_keys::SERVER_SHUTDOWN => {
            info!("shutdown requested over the wire");
            let _ = state.shutdown.send(true);
            Ok(Value::Bool(true))
        }
        other => Err(format!("unknown endpoint {other}")),
    }
}
