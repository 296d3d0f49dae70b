//! Live model instances and their reported state.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, RwLock};

use crate::circuit_breaker::BreakerState;
use crate::plugin::{ModelHandle, ModelKey, PluginDescriptor};
use crate::resources::AllocationTicket;

/// Operational status, owned by the registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Starting,
    Active,
    Idle,
    Stopping,
    Error,
}

impl ModelStatus {
    /// Whether requests may be routed to an instance in this status.
    pub fn is_serving(&self) -> bool {
        matches!(self, ModelStatus::Active | ModelStatus::Idle)
    }

    /// Whether a request may still reach the instance. Errored instances
    /// stay reachable so their breaker can answer and probe recovery.
    pub fn is_routable(&self) -> bool {
        self.is_serving() || *self == ModelStatus::Error
    }
}

impl fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelStatus::Starting => "starting",
            ModelStatus::Active => "active",
            ModelStatus::Idle => "idle",
            ModelStatus::Stopping => "stopping",
            ModelStatus::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Combine operational status with breaker state.
    pub fn derive(status: ModelStatus, breaker: BreakerState, recent_failures: usize) -> Self {
        match (status, breaker) {
            (ModelStatus::Error, _) | (_, BreakerState::Open) => HealthStatus::Unhealthy,
            (_, BreakerState::HalfOpen) => HealthStatus::Degraded,
            _ if recent_failures > 0 => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Plugin work running against an instance's handle. Teardown of the
/// instance waits until every `PluginWork` has been dropped, so work that
/// outlives its caller (a timed-out inference) still holds the model.
pub struct PluginWork {
    handle: Arc<dyn ModelHandle>,
    _in_flight: OwnedRwLockReadGuard<()>,
}

impl PluginWork {
    pub fn handle(&self) -> &dyn ModelHandle {
        self.handle.as_ref()
    }
}

/// One loaded model version.
///
/// The handle is shared read-only by every concurrent inference. Counters and
/// consumer tracking are atomics so the read path never needs the registry
/// write lock.
pub struct ModelInstance {
    descriptor: Arc<PluginDescriptor>,
    handle: Arc<dyn ModelHandle>,
    in_flight: Arc<RwLock<()>>,
    allocation: AllocationTicket,
    started_at: DateTime<Utc>,
    /// Millis since the epoch, 0 = never.
    last_inference_ms: AtomicI64,
    inferences: AtomicU64,
    failures: AtomicU64,
    cameras: DashMap<String, DateTime<Utc>>,
}

impl ModelInstance {
    pub fn new(
        descriptor: Arc<PluginDescriptor>,
        handle: Arc<dyn ModelHandle>,
        allocation: AllocationTicket,
    ) -> Self {
        Self {
            descriptor,
            handle,
            in_flight: Arc::new(RwLock::new(())),
            allocation,
            started_at: Utc::now(),
            last_inference_ms: AtomicI64::new(0),
            inferences: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cameras: DashMap::new(),
        }
    }

    pub fn key(&self) -> ModelKey {
        self.descriptor.key()
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    /// Pin the handle for one unit of plugin work.
    pub async fn begin_work(&self) -> PluginWork {
        PluginWork {
            handle: Arc::clone(&self.handle),
            _in_flight: Arc::clone(&self.in_flight).read_owned().await,
        }
    }

    pub fn allocation(&self) -> &AllocationTicket {
        &self.allocation
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn last_inference_at(&self) -> Option<DateTime<Utc>> {
        match self.last_inference_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn inference_count(&self) -> u64 {
        self.inferences.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Record an attempted inference for `camera_id`.
    pub fn record_inference(&self, camera_id: &str, succeeded: bool) {
        let now = Utc::now();
        self.last_inference_ms
            .store(now.timestamp_millis(), Ordering::Relaxed);
        self.inferences.fetch_add(1, Ordering::Relaxed);
        if !succeeded {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.cameras.insert(camera_id.to_string(), now);
    }

    /// Distinct cameras seen within `window`. Older entries are pruned.
    pub fn cameras_active(&self, window: Duration) -> usize {
        let window = chrono::Duration::from_std(window)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now() - window;
        self.cameras.retain(|_, seen| *seen >= cutoff);
        self.cameras.len()
    }

    /// True when no inference ran within `idle_after`.
    pub fn is_idle(&self, idle_after: Duration) -> bool {
        let last = self.last_inference_at().unwrap_or(self.started_at);
        match chrono::Duration::from_std(idle_after) {
            Ok(window) => Utc::now() - last >= window,
            Err(_) => false,
        }
    }

    /// Wait for outstanding plugin work, then run the unload hook.
    pub(crate) async fn teardown(&self) {
        let _drained = self.in_flight.write().await;
        self.handle.unload();
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInstance")
            .field("key", &self.key())
            .field("device", &self.allocation.device)
            .field("started_at", &self.started_at)
            .field("inferences", &self.inference_count())
            .finish()
    }
}

/// Reported view of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStatusReport {
    pub model_id: String,
    pub version: String,
    pub status: ModelStatus,
    pub health: HealthStatus,
    pub breaker: BreakerState,
    pub is_default: bool,
    pub device: String,
    pub memory_mb: u64,
    pub started_at: DateTime<Utc>,
    pub last_inference_at: Option<DateTime<Utc>>,
    pub inference_count: u64,
    pub failure_count: u64,
    pub cameras_active: usize,
    pub event_types: Vec<String>,
}
