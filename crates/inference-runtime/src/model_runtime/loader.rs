//! Model Loader
//!
//! Turns a descriptor into a registered, resource-bound instance.

use std::any::Any;
use std::sync::Arc;

use tracing::{error, info};

use super::instance::ModelInstance;
use super::registry::ModelRegistry;
use crate::error::{LoadError, PluginError};
use crate::plugin::{PluginCatalog, PluginDescriptor};
use crate::resources::AllocationTicket;

pub struct ModelLoader {
    catalog: Arc<PluginCatalog>,
    registry: Arc<ModelRegistry>,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl ModelLoader {
    pub fn new(catalog: Arc<PluginCatalog>, registry: Arc<ModelRegistry>) -> Self {
        Self { catalog, registry }
    }

    pub fn catalog(&self) -> &Arc<PluginCatalog> {
        &self.catalog
    }

    /// Allocate, load and register. Loading an already registered key
    /// returns the existing instance untouched.
    pub async fn load(&self, descriptor: Arc<PluginDescriptor>) -> Result<Arc<ModelInstance>, LoadError> {
        let key = descriptor.key();
        if let Ok(existing) = self
            .registry
            .get(&key.model_id, Some(&key.version.to_string()))
            .await
        {
            return Ok(existing);
        }

        let resources = self.registry.resources();
        let ticket = resources
            .allocate(
                descriptor.requirements.device,
                descriptor.requirements.memory_mb,
                key.clone(),
            )
            .map_err(|source| LoadError::AllocationDenied {
                key: key.clone(),
                source,
            })?;

        let instance = match self.materialize(&descriptor, &ticket).await {
            Ok(handle) => ModelInstance::new(Arc::clone(&descriptor), handle, ticket),
            Err(e) => {
                resources.release(&ticket);
                error!(model_id = %key.model_id, version = %key.version, "Load failed: {}", e);
                return Err(e);
            }
        };

        let outcome = self
            .registry
            .register(instance)
            .await
            .map_err(|_| LoadError::ShuttingDown { key: key.clone() })?;
        if outcome.inserted {
            info!(
                model_id = %key.model_id,
                version = %key.version,
                device = %outcome.instance.allocation().device,
                "Model loaded ({} MiB)",
                descriptor.requirements.memory_mb
            );
        }
        Ok(outcome.instance)
    }

    async fn materialize(
        &self,
        descriptor: &Arc<PluginDescriptor>,
        ticket: &AllocationTicket,
    ) -> Result<Arc<dyn crate::plugin::ModelHandle>, LoadError> {
        let key = descriptor.key();
        let plugin = self
            .catalog
            .resolve(descriptor)
            .ok_or_else(|| LoadError::PluginException {
                key: key.clone(),
                reason: format!("no implementation named '{}'", descriptor.plugin),
            })?;

        if !descriptor.weights_path.exists() {
            return Err(LoadError::WeightsMissing {
                key,
                path: descriptor.weights_path.clone(),
            });
        }

        info!(
            model_id = %key.model_id,
            version = %key.version,
            device = %ticket.device,
            "Loading weights from {}",
            descriptor.weights_path.display()
        );

        let task_descriptor = Arc::clone(descriptor);
        let joined = tokio::task::spawn_blocking(move || {
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                plugin.load(&task_descriptor.weights_path, &task_descriptor)
            }))
        })
        .await;

        match joined {
            Ok(Ok(Ok(handle))) => Ok(Arc::from(handle)),
            Ok(Ok(Err(PluginError::WeightsNotFound(path)))) => Err(LoadError::WeightsMissing { key, path }),
            Ok(Ok(Err(e))) => Err(LoadError::PluginException {
                key,
                reason: e.to_string(),
            }),
            Ok(Err(payload)) => Err(LoadError::PluginException {
                key,
                reason: format!("plugin panicked: {}", panic_message(payload.as_ref())),
            }),
            Err(e) => Err(LoadError::PluginException {
                key,
                reason: format!("load task failed: {}", e),
            }),
        }
    }
}
