//! Extension registry.
//!
//! An extension is a bundle of events, endpoints, tables and logic built
//! once per client and keyed by a string.  [`ExtensionType`] describes how
//! to build one: its key, the keys it depends on, and a factory.  The
//! registry constructs extensions in dependency order and owns them for the
//! client's lifetime; there is no per-extension teardown.

use crate::client::{ClientCore, ClientError};
use futures_util::future::BoxFuture;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("extension {0} already registered")]
    AlreadyRegistered(&'static str),
    #[error("extension {0} not registered")]
    NotRegistered(&'static str),
    #[error("extension {key} depends on {dependency} which is not registered")]
    MissingDependency {
        key: &'static str,
        dependency: &'static str,
    },
    #[error("extension {0} registered with a different type")]
    TypeMismatch(&'static str),
}

type ExtensionMap = Arc<RwLock<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>>;

/// How to build an extension: key, dependency keys, factory.
pub struct ExtensionType<E> {
    pub key: &'static str,
    pub dependencies: &'static [&'static str],
    pub create: fn(ExtensionContext) -> BoxFuture<'static, Result<Arc<E>, ClientError>>,
}

/// Handed to an extension factory: the client core plus typed access to the
/// already-registered extensions (its declared dependencies).
#[derive(Clone)]
pub struct ExtensionContext {
    core: Arc<ClientCore>,
    extensions: ExtensionMap,
}

impl ExtensionContext {
    pub fn core(&self) -> &Arc<ClientCore> {
        &self.core
    }

    pub async fn extension<E: Send + Sync + 'static>(
        &self,
        ty: &ExtensionType<E>,
    ) -> Result<Arc<E>, ExtensionError> {
        lookup(&self.extensions, ty).await
    }
}

pub struct ExtensionRegistry {
    core: Arc<ClientCore>,
    extensions: ExtensionMap,
}

impl ExtensionRegistry {
    pub(crate) fn new(core: Arc<ClientCore>) -> Self {
        Self {
            core,
            extensions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Builds and stores an extension.  Every declared dependency must be
    /// registered first; duplicate keys error.
    pub async fn register<E: Send + Sync + 'static>(
        &self,
        ty: &ExtensionType<E>,
    ) -> Result<Arc<E>, ClientError> {
        {
            let extensions = self.extensions.read().await;
            if extensions.contains_key(ty.key) {
                return Err(ExtensionError::AlreadyRegistered(ty.key).into());
            }
            for dependency in ty.dependencies {
                if !extensions.contains_key(dependency) {
                    return Err(ExtensionError::MissingDependency {
                        key: ty.key,
                        dependency,
                    }
                    .into());
                }
            }
        }

        let context = ExtensionContext {
            core: Arc::clone(&self.core),
            extensions: Arc::clone(&self.extensions),
        };
        let extension = (ty.create)(context).await?;
        self.extensions.write().await.insert(
            ty.key,
            Arc::clone(&extension) as Arc<dyn Any + Send + Sync>,
        );
        Ok(extension)
    }

    pub async fn get<E: Send + Sync + 'static>(
        &self,
        ty: &ExtensionType<E>,
    ) -> Result<Arc<E>, ExtensionError> {
        lookup(&self.extensions, ty).await
    }
}

async fn lookup<E: Send + Sync + 'static>(
    extensions: &ExtensionMap,
    ty: &ExtensionType<E>,
) -> Result<Arc<E>, ExtensionError> {
    let extensions = extensions.read().await;
    let stored = extensions
        .get(ty.key)
        .ok_or(ExtensionError::NotRegistered(ty.key))?;
    Arc::clone(stored)
        .downcast::<E>()
        .map_err(|_| ExtensionError::TypeMismatch(ty.key))
}
