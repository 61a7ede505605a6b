//! Named single-value cells with subscription.
//!
//! A registry key is `"<app-key>:<name>"`; by default values are scoped to
//! this client's app.  `get` is a `registry:get` endpoint round trip, `set`
//! fires `registry:update`, and `listen` tracks the key locally so the
//! subscription survives reconnects.

use crate::client::{ClientCore, ClientError, resubscribe};
use crate::endpoint::{EndpointCallError, EndpointExtension, EndpointType};
use crate::event::{EventType, ListenerId};
use crate::extension::{ExtensionContext, ExtensionType};
use crate::serializer::{Json, Noop};
use futures_util::future::BoxFuture;
use hub_protocol::{EndpointInfo, RegistryUpdate, event_keys};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

fn update_event() -> EventType<RegistryUpdate> {
    EventType::new(event_keys::REGISTRY_UPDATE, Arc::new(Json::new()))
}

fn listen_event() -> EventType<String> {
    EventType::new(event_keys::REGISTRY_LISTEN, Arc::new(Json::new()))
}

fn get_endpoint() -> EndpointType<String, Value> {
    EndpointType::new(
        EndpointInfo::new("registry", "get"),
        Arc::new(Json::new()),
        Arc::new(Noop),
    )
}

pub struct RegistryExtension {
    core: Arc<ClientCore>,
    endpoints: Arc<EndpointExtension>,
    /// Keys with live subscriptions, re-emitted on every (re)connect.
    keys: Mutex<HashSet<String>>,
}

impl RegistryExtension {
    pub const TYPE: ExtensionType<RegistryExtension> = ExtensionType {
        key: "registry",
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
        events.register(&update_event()).await?;
        events.register(&listen_event()).await?;

        let extension = Arc::new(Self {
            core: Arc::clone(&core),
            endpoints,
            keys: Mutex::new(HashSet::new()),
        });

        let weak = Arc::downgrade(&extension);
        core.add_resubscribe_hook(
            resubscribe::REGISTRY_LISTEN,
            Arc::new(move || {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(ext) = weak.upgrade() {
                        ext.relisten().await;
                    }
                })
            }),
        )
        .await;

        Ok(extension)
    }

    /// Current value of a named cell; `Value::Null` when unset.
    pub async fn get(&self, name: &str, app: Option<&str>) -> Result<Value, EndpointCallError> {
        let key = self.scoped_key(name, app);
        self.endpoints.invoke(&get_endpoint(), &key).await
    }

    pub async fn set(
        &self,
        name: &str,
        value: Value,
        app: Option<&str>,
    ) -> Result<(), ClientError> {
        let payload = RegistryUpdate {
            key: self.scoped_key(name, app),
            value,
        };
        self.core.send(&update_event(), &payload).await
    }

    /// Subscribes to a cell: `callback` fires on every matching
    /// `registry:update`.
    pub async fn listen<F, Fut>(
        &self,
        name: &str,
        app: Option<&str>,
        callback: F,
    ) -> Result<ListenerId, ClientError>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = self.scoped_key(name, app);
        let callback = Arc::new(callback);
        let filter_key = key.clone();
        let id = self
            .core
            .events()
            .add_listener(&update_event(), move |update: RegistryUpdate| {
                let callback = Arc::clone(&callback);
                let filter_key = filter_key.clone();
                async move {
                    if update.key == filter_key {
                        callback(update.value).await;
                    }
                }
            })
            .await?;

        self.keys.lock().await.insert(key.clone());
        if self.core.connection().is_connected()
            && let Err(error) = self.core.send(&listen_event(), &key).await
        {
            warn!(%key, %error, "failed to send registry listen");
        }
        Ok(id)
    }

    async fn relisten(&self) {
        let keys: Vec<String> = self.keys.lock().await.iter().cloned().collect();
        for key in keys {
            if let Err(error) = self.core.send(&listen_event(), &key).await {
                warn!(%key, %error, "failed to re-send registry listen");
            }
        }
    }

    fn scoped_key(&self, name: &str, app: Option<&str>) -> String {
        let owner = app
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| self.core.app().key());
        format!("{owner}:{name}")
    }
}

fn create_extension(
    context: ExtensionContext,
) -> BoxFuture<'static, Result<Arc<RegistryExtension>, ClientError>> {
    Box::pin(RegistryExtension::create(context))
}
