//! Correlated request/response over events.
//!
//! Caller role: `invoke` allocates a key from a per-client monotonic
//! counter, parks a one-shot future under it, and sends `endpoint:call`.
//! The matching `endpoint:receive` or `endpoint:error` resolves the future;
//! resolution is one-shot and keys are never reused while a call is
//! pending.  Disconnects do not cancel pending calls.
//!
//! Handler role: `register` records a typed handler.  Inbound calls for a
//! registered key are decoded, run, and answered with `endpoint:receive`
//! (or `endpoint:error` carrying the failure message).  All locally
//! registered endpoints are re-advertised on every (re)connect.

use crate::client::{ClientCore, ClientError, resubscribe};
use crate::connection::TransportError;
use crate::event::EventType;
use crate::extension::{ExtensionContext, ExtensionType};
use crate::serializer::{CodecError, Json, Serializer};
use futures_util::future::BoxFuture;
use hub_protocol::{EndpointCall, EndpointInfo, Envelope, event_keys};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum EndpointCallError {
    #[error("endpoint {endpoint} failed: {message}")]
    Remote { endpoint: String, message: String },
    #[error("endpoint {endpoint}: reply abandoned")]
    Abandoned { endpoint: String },
    #[error("endpoint {0} already registered")]
    AlreadyRegistered(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A typed endpoint descriptor: identity plus request/response codecs.
pub struct EndpointType<Req, Res> {
    info: EndpointInfo,
    request: Arc<dyn Serializer<Req>>,
    response: Arc<dyn Serializer<Res>>,
}

impl<Req, Res> EndpointType<Req, Res> {
    pub fn new(
        info: EndpointInfo,
        request: Arc<dyn Serializer<Req>>,
        response: Arc<dyn Serializer<Res>>,
    ) -> Self {
        Self {
            info,
            request,
            response,
        }
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn key(&self) -> String {
        self.info.key()
    }
}

impl<Req, Res> Clone for EndpointType<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            info: self.info.clone(),
            request: Arc::clone(&self.request),
            response: Arc::clone(&self.response),
        }
    }
}

fn call_event() -> EventType<EndpointCall> {
    EventType::new(event_keys::ENDPOINT_CALL, Arc::new(Json::new()))
}

fn receive_event() -> EventType<EndpointCall> {
    EventType::new(event_keys::ENDPOINT_RECEIVE, Arc::new(Json::new()))
}

fn error_event() -> EventType<hub_protocol::EndpointError> {
    EventType::new(event_keys::ENDPOINT_ERROR, Arc::new(Json::new()))
}

fn register_event() -> EventType<EndpointInfo> {
    EventType::new(event_keys::ENDPOINT_REGISTER, Arc::new(Json::new()))
}

/// The raw, undecoded reply future of a call in flight.
pub struct CallHandle {
    endpoint: String,
    rx: oneshot::Receiver<Result<Value, String>>,
}

impl CallHandle {
    pub async fn wait(self) -> Result<Value, EndpointCallError> {
        match self.rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(EndpointCallError::Remote {
                endpoint: self.endpoint,
                message,
            }),
            Err(_) => Err(EndpointCallError::Abandoned {
                endpoint: self.endpoint,
            }),
        }
    }
}

type ErasedHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

struct RegisteredHandler {
    info: EndpointInfo,
    run: ErasedHandler,
}

pub struct EndpointExtension {
    core: Arc<ClientCore>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>,
    handlers: Mutex<HashMap<String, RegisteredHandler>>,
    /// Calls issued while disconnected; transmitted once connected.
    outbox: Mutex<Vec<Envelope>>,
    counter: AtomicU64,
}

impl EndpointExtension {
    pub const TYPE: ExtensionType<EndpointExtension> = ExtensionType {
        key: "endpoint",
        dependencies: &[],
        create: create_extension,
    };

    async fn create(context: ExtensionContext) -> Result<Arc<Self>, ClientError> {
        let core = Arc::clone(context.core());
        let extension = Arc::new(Self {
            core: Arc::clone(&core),
            pending: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            outbox: Mutex::new(Vec::new()),
            counter: AtomicU64::new(0),
        });

        let events = core.events();
        events.register(&call_event()).await?;
        events.register(&receive_event()).await?;
        events.register(&error_event()).await?;
        events.register(&register_event()).await?;

        let weak = Arc::downgrade(&extension);
        events
            .add_listener(&receive_event(), move |payload: EndpointCall| {
                let weak = weak.clone();
                async move {
                    if let Some(ext) = weak.upgrade() {
                        ext.resolve(payload.key, Ok(payload.data)).await;
                    }
                }
            })
            .await?;
        let weak = Arc::downgrade(&extension);
        events
            .add_listener(
                &error_event(),
                move |payload: hub_protocol::EndpointError| {
                    let weak = weak.clone();
                    async move {
                        if let Some(ext) = weak.upgrade() {
                            ext.resolve(payload.key, Err(payload.error)).await;
                        }
                    }
                },
            )
            .await?;
        let weak = Arc::downgrade(&extension);
        events
            .add_listener(&call_event(), move |payload: EndpointCall| {
                let weak = weak.clone();
                async move {
                    if let Some(ext) = weak.upgrade() {
                        ext.handle_call(payload).await;
                    }
                }
            })
            .await?;

        let weak = Arc::downgrade(&extension);
        core.add_resubscribe_hook(
            resubscribe::ENDPOINT_REGISTER,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(ext) = weak.upgrade() {
                        ext.advertise_and_flush().await;
                    }
                })
            }),
        )
        .await;

        Ok(extension)
    }

    /// Calls an endpoint and decodes the reply.
    pub async fn invoke<Req, Res>(
        &self,
        endpoint: &EndpointType<Req, Res>,
        request: &Req,
    ) -> Result<Res, EndpointCallError> {
        let data = endpoint.request.serialize(request)?;
        let handle = self.execute(&endpoint.key(), data).await?;
        let value = handle.wait().await?;
        Ok(endpoint.response.deserialize(value)?)
    }

    /// Lower-level form: sends the call and returns the raw reply future.
    pub async fn execute(
        &self,
        endpoint: &str,
        data: Value,
    ) -> Result<CallHandle, EndpointCallError> {
        let key = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(key, tx);

        let payload = EndpointCall {
            endpoint: endpoint.to_owned(),
            key,
            data,
        };
        let envelope = Envelope::new(
            event_keys::ENDPOINT_CALL,
            serde_json::to_value(payload).map_err(CodecError::from)?,
        );
        self.send_or_queue(envelope).await?;
        Ok(CallHandle {
            endpoint: endpoint.to_owned(),
            rx,
        })
    }

    /// Registers a handler for an endpoint this app hosts.
    pub async fn register<Req, Res, F, Fut>(
        &self,
        endpoint: &EndpointType<Req, Res>,
        handler: F,
    ) -> Result<(), EndpointCallError>
    where
        Req: Send + 'static,
        Res: Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Res, Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        let key = endpoint.key();
        {
            let mut handlers = self.handlers.lock().await;
            if handlers.contains_key(&key) {
                return Err(EndpointCallError::AlreadyRegistered(key));
            }
            let request = Arc::clone(&endpoint.request);
            let response = Arc::clone(&endpoint.response);
            let handler = Arc::new(handler);
            let run: ErasedHandler = Arc::new(move |data: Value| {
                let request = Arc::clone(&request);
                let response = Arc::clone(&response);
                let handler = Arc::clone(&handler);
                Box::pin(async move {
                    let req = request
                        .deserialize(data)
                        .map_err(|error| format!("malformed request: {error}"))?;
                    let res = handler(req).await.map_err(|error| error.to_string())?;
                    response
                        .serialize(&res)
                        .map_err(|error| format!("malformed response: {error}"))
                })
            });
            handlers.insert(
                key,
                RegisteredHandler {
                    info: endpoint.info.clone(),
                    run,
                },
            );
        }

        // Mid-session registrations advertise right away; reconnects replay
        // the full set through the resubscribe hook.
        if self.core.connection().is_connected()
            && let Err(error) = self.core.send(&register_event(), endpoint.info()).await
        {
            warn!(%error, endpoint = %endpoint.key(), "failed to advertise endpoint");
        }
        Ok(())
    }

    async fn resolve(&self, key: u64, outcome: Result<Value, String>) {
        if let Some(tx) = self.pending.lock().await.remove(&key) {
            let _ = tx.send(outcome);
        }
    }

    async fn handle_call(&self, payload: EndpointCall) {
        let handler = {
            let handlers = self.handlers.lock().await;
            handlers
                .get(&payload.endpoint)
                .map(|registered| Arc::clone(&registered.run))
        };
        let Some(handler) = handler else {
            return;
        };

        let reply = match handler(payload.data).await {
            Ok(data) => Envelope::new(
                event_keys::ENDPOINT_RECEIVE,
                match serde_json::to_value(EndpointCall {
                    endpoint: payload.endpoint.clone(),
                    key: payload.key,
                    data,
                }) {
                    Ok(value) => value,
                    Err(encode_error) => {
                        error!(endpoint = %payload.endpoint, %encode_error, "failed to encode reply");
                        return;
                    }
                },
            ),
            Err(message) => {
                error!(endpoint = %payload.endpoint, %message, "endpoint handler failed");
                match serde_json::to_value(hub_protocol::EndpointError {
                    endpoint: payload.endpoint.clone(),
                    key: payload.key,
                    error: message,
                }) {
                    Ok(value) => Envelope::new(event_keys::ENDPOINT_ERROR, value),
                    Err(_) => return,
                }
            }
        };
        if let Err(error) = self.core.connection().send(reply).await {
            warn!(%error, endpoint = %payload.endpoint, "failed to send endpoint reply");
        }
    }

    async fn advertise_and_flush(&self) {
        let infos: Vec<EndpointInfo> = {
            let handlers = self.handlers.lock().await;
            handlers
                .values()
                .map(|registered| registered.info.clone())
                .collect()
        };
        for info in infos {
            if let Err(error) = self.core.send(&register_event(), &info).await {
                warn!(%error, endpoint = %info.key(), "failed to re-advertise endpoint");
            }
        }

        let queued: Vec<Envelope> = self.outbox.lock().await.drain(..).collect();
        for envelope in queued {
            if let Err(error) = self.core.connection().send(envelope).await {
                warn!(%error, "failed to flush queued endpoint call");
            }
        }
    }

    async fn send_or_queue(&self, envelope: Envelope) -> Result<(), EndpointCallError> {
        match self.core.connection().send(envelope.clone()).await {
            Ok(()) => Ok(()),
            Err(TransportError::NotConnected) => {
                self.outbox.lock().await.push(envelope);
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn create_extension(
    context: ExtensionContext,
) -> BoxFuture<'static, Result<Arc<EndpointExtension>, ClientError>> {
    Box::pin(EndpointExtension::create(context))
}
