//! Model Registry
//!
//! Map of live model instances keyed by [`ModelKey`], guarded by a
//! [`FairRwLock`]. Inference takes the read path and holds its lease for
//! the whole call; load, unload and status changes take the write path.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tracing::{debug, info, warn};

use super::fair_lock::{FairReadGuard, FairRwLock};
use super::instance::{HealthStatus, ModelInstance, ModelStatus, ModelStatusReport};
use crate::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::error::RegistryError;
use crate::plugin::ModelKey;
use crate::resources::ResourceManager;

struct RegistryEntry {
    instance: Arc<ModelInstance>,
    status: ModelStatus,
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<ModelKey, RegistryEntry>,
    defaults: HashMap<String, Version>,
    initialized: bool,
    /// Set by `unregister_all`; later registrations are refused.
    closed: bool,
}

impl RegistryState {
    /// Configured default if registered, else the highest serving version.
    fn resolve(&self, model_id: &str, version: Option<&str>) -> Result<ModelKey, RegistryError> {
        let not_found = || RegistryError::NotFound {
            model_id: model_id.to_string(),
            version: version.map(String::from),
        };

        if let Some(version) = version {
            let version = Version::parse(version)
                .map_err(|_| RegistryError::InvalidVersion(version.to_string()))?;
            let key = ModelKey::new(model_id, version);
            return match self.entries.get(&key) {
                Some(entry) if entry.status.is_routable() => Ok(key),
                _ => Err(not_found()),
            };
        }

        if let Some(default) = self.defaults.get(model_id) {
            let key = ModelKey::new(model_id, default.clone());
            if self
                .entries
                .get(&key)
                .map_or(false, |entry| entry.status.is_routable())
            {
                return Ok(key);
            }
        }

        // Highest serving version; an errored one only when nothing serves.
        let versions = || self.entries.iter().rev().filter(|(key, _)| key.model_id == model_id);
        versions()
            .find(|(_, entry)| entry.status.is_serving())
            .or_else(|| versions().find(|(_, entry)| entry.status.is_routable()))
            .map(|(key, _)| key.clone())
            .ok_or_else(not_found)
    }

    fn is_default(&self, key: &ModelKey) -> bool {
        match self.defaults.get(&key.model_id) {
            Some(version) => *version == key.version,
            None => self
                .entries
                .keys()
                .rev()
                .find(|k| k.model_id == key.model_id)
                .map_or(false, |k| k == key),
        }
    }
}

fn log_status_change(key: &ModelKey, previous: ModelStatus, status: ModelStatus) {
    if previous == status {
        return;
    }
    match status {
        ModelStatus::Error => warn!(model_id = %key.model_id, version = %key.version, "Model status {} -> {}", previous, status),
        _ => info!(model_id = %key.model_id, version = %key.version, "Model status {} -> {}", previous, status),
    }
}

/// Result of [`ModelRegistry::register`].
pub struct RegisterOutcome {
    pub instance: Arc<ModelInstance>,
    /// False when the key was already registered and `instance` is the
    /// existing one.
    pub inserted: bool,
}

/// An instance pinned for the duration of one inference. While a lease is
/// alive the instance cannot be unregistered.
pub struct ModelLease<'a> {
    instance: Arc<ModelInstance>,
    _guard: FairReadGuard<'a, RegistryState>,
}

impl Deref for ModelLease<'_> {
    type Target = Arc<ModelInstance>;

    fn deref(&self) -> &Arc<ModelInstance> {
        &self.instance
    }
}

pub struct ModelRegistry {
    state: FairRwLock<RegistryState>,
    resources: Arc<ResourceManager>,
}

impl ModelRegistry {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self {
            state: FairRwLock::default(),
            resources,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub async fn get(
        &self,
        model_id: &str,
        version: Option<&str>,
    ) -> Result<Arc<ModelInstance>, RegistryError> {
        let state = self.state.acquire_read().await;
        let key = state.resolve(model_id, version)?;
        state
            .entries
            .get(&key)
            .map(|entry| Arc::clone(&entry.instance))
            .ok_or_else(|| RegistryError::NotFound {
                model_id: model_id.to_string(),
                version: version.map(String::from),
            })
    }

    /// Resolve and pin an instance, holding the read lock until the lease
    /// drops.
    pub async fn lease(
        &self,
        model_id: &str,
        version: Option<&str>,
    ) -> Result<ModelLease<'_>, RegistryError> {
        let guard = self.state.acquire_read().await;
        let key = guard.resolve(model_id, version)?;
        let instance = guard
            .entries
            .get(&key)
            .map(|entry| Arc::clone(&entry.instance))
            .ok_or_else(|| RegistryError::NotFound {
                model_id: model_id.to_string(),
                version: version.map(String::from),
            })?;
        Ok(ModelLease {
            instance,
            _guard: guard,
        })
    }

    pub async fn contains(&self, key: &ModelKey) -> bool {
        self.state.acquire_read().await.entries.contains_key(key)
    }

    pub async fn status_of(&self, key: &ModelKey) -> Option<ModelStatus> {
        self.state
            .acquire_read()
            .await
            .entries
            .get(key)
            .map(|entry| entry.status)
    }

    pub async fn keys(&self) -> Vec<ModelKey> {
        self.state.acquire_read().await.entries.keys().cloned().collect()
    }

    /// Insert a freshly loaded instance as active. If the key is already
    /// registered the existing instance wins and the newcomer's allocation
    /// is released. After `unregister_all` the newcomer is torn down and
    /// [`RegistryError::Closed`] returned.
    pub async fn register(&self, instance: ModelInstance) -> Result<RegisterOutcome, RegistryError> {
        let key = instance.key();
        let mut state = self.state.acquire_write().await;

        if state.closed {
            drop(state);
            warn!(model_id = %key.model_id, version = %key.version, "Registry closed; discarding late load");
            instance.teardown().await;
            self.resources.release(instance.allocation());
            return Err(RegistryError::Closed);
        }

        if let Some(existing) = state.entries.get(&key) {
            let existing = Arc::clone(&existing.instance);
            drop(state);
            debug!(model_id = %key.model_id, version = %key.version, "Already registered; discarding duplicate load");
            instance.teardown().await;
            self.resources.release(instance.allocation());
            return Ok(RegisterOutcome {
                instance: existing,
                inserted: false,
            });
        }

        let instance = Arc::new(instance);
        state.entries.insert(
            key.clone(),
            RegistryEntry {
                instance: Arc::clone(&instance),
                status: ModelStatus::Active,
            },
        );
        let loaded = state.entries.len();
        drop(state);

        crate::metrics::set_loaded_models(loaded);
        info!(
            model_id = %key.model_id,
            version = %key.version,
            device = %instance.allocation().device,
            "Model registered"
        );
        Ok(RegisterOutcome {
            instance,
            inserted: true,
        })
    }

    /// Stop, release and remove one version in a single write section.
    /// Waits for in-flight inferences holding a lease and for plugin work
    /// that outlived a timed-out caller.
    pub async fn unregister(&self, model_id: &str, version: &Version) -> Result<(), RegistryError> {
        let key = ModelKey::new(model_id, version.clone());
        let mut state = self.state.acquire_write().await;

        let Some(entry) = state.entries.get_mut(&key) else {
            return Err(RegistryError::NotFound {
                model_id: model_id.to_string(),
                version: Some(version.to_string()),
            });
        };
        entry.status = ModelStatus::Stopping;
        let instance = Arc::clone(&entry.instance);

        instance.teardown().await;
        self.resources.release(instance.allocation());
        state.entries.remove(&key);
        let loaded = state.entries.len();
        drop(state);

        crate::metrics::set_loaded_models(loaded);
        info!(model_id = %model_id, version = %version, "Model unregistered");
        Ok(())
    }

    /// Tear down every instance and close the registry to new ones.
    /// Returns how many were removed.
    pub async fn unregister_all(&self) -> usize {
        let mut state = self.state.acquire_write().await;
        state.closed = true;
        let entries = std::mem::take(&mut state.entries);
        let count = entries.len();
        for (key, mut entry) in entries {
            entry.status = ModelStatus::Stopping;
            entry.instance.teardown().await;
            self.resources.release(entry.instance.allocation());
            debug!(model_id = %key.model_id, version = %key.version, "Model unregistered");
        }
        drop(state);

        crate::metrics::set_loaded_models(0);
        if count > 0 {
            info!("Unregistered {} models", count);
        }
        count
    }

    /// Point unversioned requests for `model_id` at `version`. The version
    /// does not need to be loaded yet.
    pub async fn set_default_version(&self, model_id: &str, version: Version) {
        let mut state = self.state.acquire_write().await;
        info!(model_id = %model_id, version = %version, "Default version set");
        state.defaults.insert(model_id.to_string(), version);
    }

    pub async fn default_version(&self, model_id: &str) -> Option<Version> {
        let state = self.state.acquire_read().await;
        state
            .resolve(model_id, None)
            .ok()
            .map(|key| key.version)
    }

    /// Returns the previous status, or `None` when the key is not registered.
    pub async fn set_status(&self, key: &ModelKey, status: ModelStatus) -> Option<ModelStatus> {
        let mut state = self.state.acquire_write().await;
        let entry = state.entries.get_mut(key)?;
        let previous = std::mem::replace(&mut entry.status, status);
        log_status_change(key, previous, status);
        Some(previous)
    }

    /// Mirror the breaker's current state into the entry status: open means
    /// error, closed means active, half-open leaves it alone. The breaker is
    /// read inside the write section, so racing updates settle on its latest
    /// state. Entries that are not routable are never touched.
    pub async fn sync_breaker_status(&self, key: &ModelKey, breakers: &BreakerRegistry) -> Option<ModelStatus> {
        let mut state = self.state.acquire_write().await;
        let entry = state.entries.get_mut(key)?;
        let status = match breakers.state_of(key) {
            BreakerState::Open => ModelStatus::Error,
            BreakerState::Closed => ModelStatus::Active,
            BreakerState::HalfOpen => return Some(entry.status),
        };
        if !entry.status.is_routable() {
            return Some(entry.status);
        }
        let previous = std::mem::replace(&mut entry.status, status);
        log_status_change(key, previous, status);
        Some(status)
    }

    pub async fn mark_initialized(&self) {
        self.state.acquire_write().await.initialized = true;
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.acquire_read().await.initialized
    }

    /// Status of every registered instance, ordered by key. An active
    /// instance with no inference within `idle_after` reports idle.
    pub async fn list_status(
        &self,
        breakers: &BreakerRegistry,
        idle_after: Duration,
        camera_window: Duration,
    ) -> Vec<ModelStatusReport> {
        let state = self.state.acquire_read().await;
        state
            .entries
            .iter()
            .map(|(key, entry)| {
                let instance = &entry.instance;
                let status = match entry.status {
                    ModelStatus::Active if instance.is_idle(idle_after) => ModelStatus::Idle,
                    status => status,
                };
                let breaker = breakers.snapshot(key);
                let breaker_state = breaker.as_ref().map(|b| b.state).unwrap_or_default();
                let recent_failures = breaker.as_ref().map_or(0, |b| b.failure_count);
                let allocation = instance.allocation();
                ModelStatusReport {
                    model_id: key.model_id.clone(),
                    version: key.version.to_string(),
                    status,
                    health: HealthStatus::derive(status, breaker_state, recent_failures),
                    breaker: breaker_state,
                    is_default: state.is_default(key),
                    device: allocation.device.to_string(),
                    memory_mb: allocation.amount_mb,
                    started_at: instance.started_at(),
                    last_inference_at: instance.last_inference_at(),
                    inference_count: instance.inference_count(),
                    failure_count: instance.failure_count(),
                    cameras_active: instance.cameras_active(camera_window),
                    event_types: instance.descriptor().event_types.clone(),
                }
            })
            .collect()
    }

    /// Model ids with at least one serving version.
    pub async fn serving_models(&self) -> Vec<String> {
        let state = self.state.acquire_read().await;
        let mut ids: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.status.is_serving())
            .map(|(key, _)| key.model_id.clone())
            .collect();
        ids.dedup();
        ids
    }
}
