//! Background registration and health push loop.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::backend_client::{BackendRegistry, HealthSnapshot, ModelCapability};

/// Supplies what the reporter pushes.
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn capabilities(&self) -> Vec<ModelCapability>;

    async fn snapshot(&self) -> HealthSnapshot;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReporterConfig {
    pub interval: Duration,
    /// Attempts per registration or deregistration push.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Exponential backoff with jitter in `[delay / 2, delay]`.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exp = initial.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(max);
    let factor = rand::thread_rng().gen_range(0.5..=1.0);
    capped.mul_f64(factor)
}

async fn with_retry<F, Fut>(what: &str, config: &ReporterConfig, mut op: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if attempt + 1 >= attempts => {
                return Err(e.context(format!("{} failed after {} attempts", what, attempts)));
            }
            Err(e) => {
                let delay = backoff_delay(attempt, config.initial_backoff, config.max_backoff);
                debug!("{} attempt {} failed: {}; retrying in {:?}", what, attempt + 1, e, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

struct ReporterInner {
    runtime_id: String,
    backend: Arc<dyn BackendRegistry>,
    source: Arc<dyn HealthSource>,
    config: ReporterConfig,
    registered: AtomicBool,
}

impl ReporterInner {
    async fn register(&self) -> anyhow::Result<()> {
        let capabilities = self.source.capabilities().await;
        with_retry("register", &self.config, || {
            self.backend.register(&self.runtime_id, &capabilities)
        })
        .await?;
        self.registered.store(true, Ordering::SeqCst);
        info!(
            "Runtime {} registered with backend ({} capabilities)",
            self.runtime_id,
            capabilities.len()
        );
        Ok(())
    }

    async fn report_once(&self) {
        if !self.registered.load(Ordering::SeqCst) {
            if let Err(e) = self.register().await {
                warn!("Backend registration failed, will retry next tick: {:#}", e);
                return;
            }
        }
        let snapshot = self.source.snapshot().await;
        match self.backend.health(&self.runtime_id, &snapshot).await {
            Ok(()) => debug!("Health pushed ({} models)", snapshot.models.len()),
            Err(e) => warn!("Health push failed: {}", e),
        }
    }
}

/// Pushes capabilities and health to the backend until shut down. Failures
/// are logged and never affect inference.
pub struct HealthReporter {
    inner: Arc<ReporterInner>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// One-off pushes (capability refreshes, version removals). Aborted on
    /// shutdown so none of them lands after deregistration.
    pushes: Mutex<JoinSet<()>>,
}

impl HealthReporter {
    /// Start the loop. The first tick fires immediately.
    pub fn spawn(
        runtime_id: impl Into<String>,
        backend: Arc<dyn BackendRegistry>,
        source: Arc<dyn HealthSource>,
        config: ReporterConfig,
    ) -> Self {
        let inner = Arc::new(ReporterInner {
            runtime_id: runtime_id.into(),
            backend,
            source,
            config,
            registered: AtomicBool::new(false),
        });
        let (stop, mut stopped) = watch::channel(false);

        let worker = Arc::clone(&inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(worker.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = worker.report_once() => {}
                }
            }
            debug!("Health reporter loop stopped");
        });

        info!(
            "Health reporter started for {} (every {:?})",
            inner.runtime_id, inner.config.interval
        );
        Self {
            inner,
            stop,
            task: Mutex::new(Some(task)),
            pushes: Mutex::new(JoinSet::new()),
        }
    }

    /// Spawn a one-off push unless shutdown has begun. The stop flag is read
    /// under the same lock `shutdown` takes to drain the set.
    fn spawn_push<F>(&self, push: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pushes = self.pushes.lock().unwrap_or_else(|e| e.into_inner());
        if *self.stop.borrow() {
            debug!("Reporter stopped; dropping backend push");
            return;
        }
        while pushes.try_join_next().is_some() {}
        pushes.spawn(push);
    }

    pub fn runtime_id(&self) -> &str {
        &self.inner.runtime_id
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// Re-send the capability list, e.g. after a load or rescan.
    pub fn refresh_capabilities(&self) {
        let inner = Arc::clone(&self.inner);
        self.spawn_push(async move {
            if let Err(e) = inner.register().await {
                warn!("Capability refresh failed: {:#}", e);
            }
        });
    }

    /// Tell the backend a version is gone.
    pub fn notify_version_removed(&self, model_id: &str, version: &str) {
        let inner = Arc::clone(&self.inner);
        let model_id = model_id.to_string();
        let version = version.to_string();
        self.spawn_push(async move {
            let result = with_retry("deregister_version", &inner.config, || {
                inner
                    .backend
                    .deregister_version(&inner.runtime_id, &model_id, &version)
            })
            .await;
            match result {
                Ok(()) => debug!("Backend notified of removed {}@{}", model_id, version),
                Err(e) => warn!("Could not notify backend of removed {}@{}: {:#}", model_id, version, e),
            }
        });
    }

    /// Stop the loop, cancel pending pushes and deregister. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        let mut pushes = {
            let mut pushes = self.pushes.lock().unwrap_or_else(|e| e.into_inner());
            self.stop.send_replace(true);
            std::mem::take(&mut *pushes)
        };
        pushes.abort_all();
        while pushes.join_next().await.is_some() {}

        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else {
            return;
        };
        if let Err(e) = task.await {
            warn!("Health reporter task ended abnormally: {}", e);
        }

        if !self.inner.registered.swap(false, Ordering::SeqCst) {
            debug!("Runtime was never registered; skipping deregistration");
            return;
        }
        let inner = &self.inner;
        match with_retry("deregister", &inner.config, || inner.backend.deregister(&inner.runtime_id)).await {
            Ok(()) => info!("Runtime {} deregistered", inner.runtime_id),
            Err(e) => warn!("Deregistration failed: {:#}", e),
        }
    }
}
