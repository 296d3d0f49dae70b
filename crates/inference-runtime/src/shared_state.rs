//! Process-wide runtime state
//!
//! `RuntimeState` owns every component and is the only way the server or an
//! embedding host reaches them. Startup and teardown are explicit: nothing is
//! initialized on first use and nothing is left to `Drop`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use semver::Version;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{BreakerRegistry, BreakerState, BreakerStore, InMemoryBreakerStore, SqliteBreakerStore};
use crate::config::Config;
use crate::dispatcher::{DetectionResult, InferenceDispatcher, InferenceMetadata};
use crate::error::{DispatchError, LoadError, RegistryError, RuntimeError};
use crate::health_reporter::{
    BackendRegistry, HealthReporter, HealthSnapshot, HealthSource, HttpBackendClient, ModelCapability, Readiness,
};
use crate::model_runtime::{
    DiscoveryReport, HealthStatus, ModelDiscovery, ModelInstance, ModelLoader, ModelRegistry, ModelStatus,
    ModelStatusReport,
};
use crate::plugin::{Frame, ModelKey, PluginCatalog, PluginDescriptor};
use crate::resources::ResourceManager;

const BACKEND_TIMEOUT: Duration = Duration::from_secs(10);

type Discovered = Arc<RwLock<Vec<Arc<PluginDescriptor>>>>;

/// Read-only view used for readiness, status listings and health pushes.
pub struct RuntimeProbe {
    runtime_id: String,
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerRegistry>,
    resources: Arc<ResourceManager>,
    discovered: Discovered,
    loading: Arc<DashMap<ModelKey, (Arc<PluginDescriptor>, DateTime<Utc>)>>,
    required_models: Vec<String>,
    idle_after: Duration,
    camera_window: Duration,
}

impl RuntimeProbe {
    /// Ready once initialized, every required model has a serving version
    /// and device memory is not exhausted.
    pub async fn readiness(&self) -> Readiness {
        let mut reasons = Vec::new();
        if !self.registry.is_initialized().await {
            reasons.push("registry not initialized".to_string());
        }

        let serving = self.registry.serving_models().await;
        for required in &self.required_models {
            if !serving.contains(required) {
                reasons.push(format!("required model '{}' has no serving version", required));
            }
        }

        if self.resources.is_exhausted() {
            reasons.push("device memory exhausted".to_string());
        }

        Readiness {
            ready: reasons.is_empty(),
            reasons,
        }
    }

    /// Registered instances plus loads still in progress.
    pub async fn models(&self) -> Vec<ModelStatusReport> {
        let mut reports = self
            .registry
            .list_status(&self.breakers, self.idle_after, self.camera_window)
            .await;

        for entry in self.loading.iter() {
            let (descriptor, since) = entry.value();
            if reports
                .iter()
                .any(|r| r.model_id == descriptor.model_id && r.version == descriptor.version.to_string())
            {
                continue;
            }
            reports.push(ModelStatusReport {
                model_id: descriptor.model_id.clone(),
                version: descriptor.version.to_string(),
                status: ModelStatus::Starting,
                health: HealthStatus::derive(ModelStatus::Starting, BreakerState::Closed, 0),
                breaker: self.breakers.state_of(entry.key()),
                is_default: false,
                device: descriptor.requirements.device.to_string(),
                memory_mb: descriptor.requirements.memory_mb,
                started_at: *since,
                last_inference_at: None,
                inference_count: 0,
                failure_count: 0,
                cameras_active: 0,
                event_types: descriptor.event_types.clone(),
            });
        }
        reports
    }
}

#[async_trait]
impl HealthSource for RuntimeProbe {
    async fn capabilities(&self) -> Vec<ModelCapability> {
        let discovered = self.discovered.read().await.clone();
        let mut capabilities = Vec::with_capacity(discovered.len());
        for descriptor in discovered {
            let loaded = self.registry.contains(&descriptor.key()).await;
            capabilities.push(ModelCapability::from_descriptor(&descriptor, loaded));
        }
        capabilities
    }

    async fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            runtime_id: self.runtime_id.clone(),
            readiness: self.readiness().await,
            models: self.models().await,
            devices: self.resources.usage(),
            reported_at: Utc::now(),
        }
    }
}

/// Owner of every runtime component.
pub struct RuntimeState {
    config: Arc<Config>,
    resources: Arc<ResourceManager>,
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerRegistry>,
    loader: ModelLoader,
    dispatcher: InferenceDispatcher,
    discovery: ModelDiscovery,
    probe: Arc<RuntimeProbe>,
    reporter: Option<HealthReporter>,
    shutting_down: AtomicBool,
}

impl RuntimeState {
    /// Initialize with the built-in plugins and, when `BACKEND_URL` is set,
    /// the HTTP backend client.
    pub async fn start(config: Config) -> anyhow::Result<Self> {
        let backend = config.backend_url.as_ref().map(|url| {
            Arc::new(HttpBackendClient::new(url.clone(), BACKEND_TIMEOUT)) as Arc<dyn BackendRegistry>
        });
        Self::initialize(config, PluginCatalog::with_builtins(), backend).await
    }

    /// Bring the runtime up in dependency order: devices, breaker state,
    /// discovery, autoload, default versions, then reporting.
    ///
    /// Only resource manager and breaker store failures are fatal. A missing
    /// models root or a failed autoload leaves the runtime up but possibly
    /// not ready.
    pub async fn initialize(
        config: Config,
        catalog: PluginCatalog,
        backend: Option<Arc<dyn BackendRegistry>>,
    ) -> anyhow::Result<Self> {
        info!("Initializing runtime {}", config.runtime_id);
        config.validate()?;
        crate::metrics::init_metrics();
        let config = Arc::new(config);

        let resources = Arc::new(
            ResourceManager::new(config.device_inventory()).context("failed to initialize resource manager")?,
        );

        let store: Arc<dyn BreakerStore> = match &config.breaker_db_path {
            Some(path) => Arc::new(
                SqliteBreakerStore::open(path)
                    .with_context(|| format!("failed to open breaker store at {}", path.display()))?,
            ),
            None => Arc::new(InMemoryBreakerStore::new()),
        };
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone(), store));
        breakers.restore().context("failed to restore circuit breaker state")?;

        let registry = Arc::new(ModelRegistry::new(Arc::clone(&resources)));
        let loader = ModelLoader::new(Arc::new(catalog), Arc::clone(&registry));
        let dispatcher = InferenceDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            config.max_concurrent_inferences,
            config.inference_timeout(),
        );

        let probe = Arc::new(RuntimeProbe {
            runtime_id: config.runtime_id.clone(),
            registry: Arc::clone(&registry),
            breakers: Arc::clone(&breakers),
            resources: Arc::clone(&resources),
            discovered: Arc::new(RwLock::new(Vec::new())),
            loading: Arc::new(DashMap::new()),
            required_models: config.required_models.clone(),
            idle_after: Duration::from_secs(config.idle_after_seconds),
            camera_window: Duration::from_secs(config.camera_idle_seconds),
        });

        let mut state = Self {
            discovery: ModelDiscovery::new(config.models_root.clone()),
            config: Arc::clone(&config),
            resources,
            registry,
            breakers,
            loader,
            dispatcher,
            probe,
            reporter: None,
            shutting_down: AtomicBool::new(false),
        };

        if let Err(e) = state.rescan_quiet().await {
            warn!("Model discovery failed: {:#}", e);
        }
        state.autoload().await;

        for (model_id, version) in &config.default_versions {
            if state.find_descriptor(model_id, version).await.is_none() {
                warn!(model_id = %model_id, version = %version, "Default version was not discovered");
            }
            state.registry.set_default_version(model_id, version.clone()).await;
        }

        state.registry.mark_initialized().await;

        if let Some(backend) = backend {
            state.reporter = Some(HealthReporter::spawn(
                config.runtime_id.clone(),
                backend,
                Arc::clone(&state.probe) as Arc<dyn HealthSource>,
                config.reporter_config(),
            ));
        } else {
            info!("No backend configured; health reporting disabled");
        }

        let readiness = state.probe.readiness().await;
        if readiness.ready {
            info!("Runtime {} ready", config.runtime_id);
        } else {
            warn!("Runtime {} not ready: {}", config.runtime_id, readiness.reasons.join("; "));
        }
        Ok(state)
    }

    async fn autoload(&self) {
        let candidates: Vec<Arc<PluginDescriptor>> = self
            .probe
            .discovered
            .read()
            .await
            .iter()
            .filter(|d| self.config.autoload.includes(d))
            .cloned()
            .collect();

        let mut loaded = 0;
        for descriptor in candidates {
            match self.load_descriptor(descriptor).await {
                Ok(_) => loaded += 1,
                Err(e) => warn!("Autoload skipped: {}", e),
            }
        }
        info!("Autoloaded {} models", loaded);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn dispatcher(&self) -> &InferenceDispatcher {
        &self.dispatcher
    }

    pub fn probe(&self) -> &Arc<RuntimeProbe> {
        &self.probe
    }

    pub fn reporter(&self) -> Option<&HealthReporter> {
        self.reporter.as_ref()
    }

    /// The process is up. Always true while the state exists.
    pub fn liveness(&self) -> bool {
        true
    }

    pub async fn readiness(&self) -> Readiness {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Readiness {
                ready: false,
                reasons: vec!["shutting down".to_string()],
            };
        }
        self.probe.readiness().await
    }

    pub async fn list_status(&self) -> Vec<ModelStatusReport> {
        self.probe.models().await
    }

    pub async fn discovered(&self) -> Vec<Arc<PluginDescriptor>> {
        self.probe.discovered.read().await.clone()
    }

    async fn find_descriptor(&self, model_id: &str, version: &Version) -> Option<Arc<PluginDescriptor>> {
        self.probe
            .discovered
            .read()
            .await
            .iter()
            .find(|d| d.model_id == model_id && d.version == *version)
            .cloned()
    }

    async fn rescan_quiet(&self) -> anyhow::Result<DiscoveryReport> {
        let discovery = self.discovery.clone();
        let report = tokio::task::spawn_blocking(move || discovery.discover_with_report())
            .await
            .context("discovery task failed")??;
        let descriptors = report.descriptors.iter().cloned().map(Arc::new).collect();
        *self.probe.discovered.write().await = descriptors;
        Ok(report)
    }

    /// Re-walk the models root. Loaded instances are untouched; the
    /// capability list pushed to the backend is refreshed.
    pub async fn rescan(&self) -> anyhow::Result<DiscoveryReport> {
        let report = self.rescan_quiet().await?;
        if let Some(reporter) = &self.reporter {
            reporter.refresh_capabilities();
        }
        Ok(report)
    }

    async fn load_descriptor(&self, descriptor: Arc<PluginDescriptor>) -> Result<Arc<ModelInstance>, RuntimeError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RuntimeError::ShuttingDown);
        }
        let key = descriptor.key();
        self.probe
            .loading
            .insert(key.clone(), (Arc::clone(&descriptor), Utc::now()));
        let result = self.loader.load(descriptor).await;
        self.probe.loading.remove(&key);
        match result {
            Ok(instance) => Ok(instance),
            Err(LoadError::ShuttingDown { .. }) => Err(RuntimeError::ShuttingDown),
            Err(e) => Err(e.into()),
        }
    }

    /// Load one discovered version.
    pub async fn load_model(&self, model_id: &str, version: &str) -> Result<Arc<ModelInstance>, RuntimeError> {
        let version = parse_version(version)?;
        let descriptor = self
            .find_descriptor(model_id, &version)
            .await
            .ok_or_else(|| RuntimeError::NotDiscovered {
                model_id: model_id.to_string(),
                version: version.to_string(),
            })?;
        let instance = self.load_descriptor(descriptor).await?;
        if let Some(reporter) = &self.reporter {
            reporter.refresh_capabilities();
        }
        Ok(instance)
    }

    /// Unload one version. Waits for in-flight inferences on it.
    pub async fn unload_model(&self, model_id: &str, version: &str) -> Result<(), RuntimeError> {
        let version = parse_version(version)?;
        self.registry.unregister(model_id, &version).await?;
        if let Some(reporter) = &self.reporter {
            reporter.notify_version_removed(model_id, &version.to_string());
        }
        Ok(())
    }

    /// Re-read the descriptor from disk and swap the instance.
    pub async fn reload_model(&self, model_id: &str, version: &str) -> Result<Arc<ModelInstance>, RuntimeError> {
        let parsed = parse_version(version)?;
        if let Err(e) = self.rescan_quiet().await {
            warn!("Rescan before reload failed, using cached descriptors: {:#}", e);
        }
        match self.registry.unregister(model_id, &parsed).await {
            Ok(()) | Err(RegistryError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        debug!(model_id = %model_id, version = %parsed, "Reloading");
        self.load_model(model_id, version).await
    }

    /// Point unversioned requests for `model_id` at a discovered version.
    pub async fn set_default(&self, model_id: &str, version: &str) -> Result<(), RuntimeError> {
        let version = parse_version(version)?;
        if self.find_descriptor(model_id, &version).await.is_none()
            && !self.registry.contains(&ModelKey::new(model_id, version.clone())).await
        {
            return Err(RuntimeError::NotDiscovered {
                model_id: model_id.to_string(),
                version: version.to_string(),
            });
        }
        self.registry.set_default_version(model_id, version).await;
        Ok(())
    }

    pub async fn infer(
        &self,
        model_id: &str,
        version: Option<&str>,
        frame: Frame,
        metadata: InferenceMetadata,
    ) -> Result<DetectionResult, DispatchError> {
        self.dispatcher.infer(model_id, version, frame, metadata).await
    }

    /// Deregister from the backend, unload every model, then return all
    /// device memory. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        info!("Shutting down runtime {}", self.config.runtime_id);

        if let Some(reporter) = &self.reporter {
            reporter.shutdown().await;
        }
        let unloaded = self.registry.unregister_all().await;
        let released = self.resources.release_all();
        info!(
            "Runtime stopped ({} models unloaded, {} stray allocations released)",
            unloaded, released
        );
    }
}

fn parse_version(version: &str) -> Result<Version, RuntimeError> {
    Version::parse(version).map_err(|_| RuntimeError::InvalidVersion(version.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Autoload, GpuDevices};
    use crate::plugin::test_support::ScriptedPlugin;
    use crate::plugin::FrameStatsPlugin;
    use crate::resources::{DeviceId, DeviceSpec};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_model(root: &Path, model_id: &str, version: &str, memory_mb: u64) {
        write_plugin_model(root, model_id, version, memory_mb, FrameStatsPlugin::NAME);
    }

    fn write_plugin_model(root: &Path, model_id: &str, version: &str, memory_mb: u64, plugin: &str) {
        let dir = root.join(model_id).join(version);
        fs::create_dir_all(&dir).unwrap();
        for stem in ["loader", "preprocess", "inference", "postprocess"] {
            fs::write(dir.join(format!("{}.py", stem)), "").unwrap();
        }
        fs::write(dir.join("weights"), b"w").unwrap();
        fs::write(
            dir.join("plugin.json"),
            format!(
                r#"{{"plugin": "{}", "event_types": ["activity"], "resources": {{"memory_mb": {}, "device": "any"}}}}"#,
                plugin,
                memory_mb
            ),
        )
        .unwrap();
    }

    fn config(root: &Path) -> Config {
        Config {
            models_root: root.to_path_buf(),
            gpu_devices: GpuDevices::Explicit(vec![DeviceSpec { id: DeviceId::Gpu(0), total_mb: 4096 }]),
            cpu_memory_mb: Some(1024),
            breaker_db_path: None,
            max_concurrent_inferences: 4,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_autoloads_and_is_ready() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "fall_detection", "1.0.0", 512);
        let mut cfg = config(dir.path());
        cfg.required_models = vec!["fall_detection".into()];

        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        assert!(state.readiness().await.ready);
        assert_eq!(state.list_status().await.len(), 1);
        state.shutdown().await;
        assert!(!state.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_missing_required_model_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(dir.path());
        cfg.required_models = vec!["ppe".into()];

        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        let readiness = state.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reasons[0].contains("ppe"));
    }

    #[tokio::test]
    async fn test_missing_models_root_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir.path().join("absent"));
        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        assert!(state.discovered().await.is_empty());
        assert!(state.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_load_unload_and_rescan() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "fall_detection", "1.0.0", 512);
        let mut cfg = config(dir.path());
        cfg.autoload = Autoload::None;
        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        assert!(state.list_status().await.is_empty());

        write_model(dir.path(), "fall_detection", "1.1.0", 512);
        let err = state.load_model("fall_detection", "1.1.0").await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotDiscovered { .. }));

        assert_eq!(state.rescan().await.unwrap().descriptors.len(), 2);
        state.load_model("fall_detection", "1.1.0").await.unwrap();
        assert_eq!(state.resources().outstanding(), 1);

        state.unload_model("fall_detection", "1.1.0").await.unwrap();
        assert_eq!(state.resources().outstanding(), 0);
        assert!(matches!(
            state.unload_model("fall_detection", "1.1.0").await,
            Err(RuntimeError::Registry(RegistryError::NotFound { .. }))
        ));
        assert!(matches!(
            state.load_model("fall_detection", "latest").await,
            Err(RuntimeError::InvalidVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_model_surfaces_load_error() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "fall_detection", "1.0.0", 1_000_000);
        let state = RuntimeState::initialize(config(dir.path()), PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        assert!(state.list_status().await.is_empty());

        let err = state.load_model("fall_detection", "1.0.0").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Load(LoadError::AllocationDenied { .. })));
        assert!(state.registry().keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_default_version_from_config() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "fall_detection", "1.0.0", 256);
        write_model(dir.path(), "fall_detection", "1.1.0", 256);
        let mut cfg = config(dir.path());
        cfg.default_versions
            .insert("fall_detection".into(), Version::new(1, 0, 0));

        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        assert_eq!(
            state.registry().default_version("fall_detection").await,
            Some(Version::new(1, 0, 0))
        );

        state.set_default("fall_detection", "1.1.0").await.unwrap();
        assert_eq!(
            state.registry().default_version("fall_detection").await,
            Some(Version::new(1, 1, 0))
        );
        assert!(state.set_default("fall_detection", "9.9.9").await.is_err());
    }

    #[tokio::test]
    async fn test_loads_rejected_after_shutdown() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "fall_detection", "1.0.0", 256);
        let mut cfg = config(dir.path());
        cfg.autoload = Autoload::None;
        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();

        state.shutdown().await;
        state.shutdown().await;
        assert!(matches!(
            state.load_model("fall_detection", "1.0.0").await,
            Err(RuntimeError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_oversized_autoload_does_not_block_readiness() {
        let dir = TempDir::new().unwrap();
        write_model(dir.path(), "fall_detection", "1.0.0", 256);
        write_model(dir.path(), "ppe", "1.0.0", 1_000_000);
        let mut cfg = config(dir.path());
        cfg.required_models = vec!["fall_detection".into()];

        let state = RuntimeState::initialize(cfg, PluginCatalog::with_builtins(), None)
            .await
            .unwrap();
        assert_eq!(state.registry().keys().await.len(), 1);
        let readiness = state.readiness().await;
        assert!(readiness.ready, "{:?}", readiness.reasons);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_load_leaves_nothing_registered() {
        let dir = TempDir::new().unwrap();
        write_plugin_model(dir.path(), "fall_detection", "1.0.0", 256, "scripted");
        let mut cfg = config(dir.path());
        cfg.autoload = Autoload::None;
        let plugin = ScriptedPlugin::new();
        plugin.load_delay_ms.store(200, std::sync::atomic::Ordering::SeqCst);
        let mut catalog = PluginCatalog::new();
        catalog.register("scripted", plugin.clone());

        let state = Arc::new(RuntimeState::initialize(cfg, catalog, None).await.unwrap());
        let loading = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.load_model("fall_detection", "1.0.0").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        state.shutdown().await;

        let result = loading.await.unwrap();
        assert!(matches!(result, Err(RuntimeError::ShuttingDown)));
        assert!(state.registry().keys().await.is_empty());
        assert_eq!(state.resources().outstanding(), 0);
        assert_eq!(plugin.unloads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
