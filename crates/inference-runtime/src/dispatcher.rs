//! Inference Dispatcher
//!
//! Routes one frame through a leased model instance:
//! lease (registry read path) -> breaker permit -> request validation ->
//! preprocess/infer/postprocess on a blocking thread -> output validation.
//! Plugin failures never reach the caller as errors; they feed the breaker
//! and come back as degraded results.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use validator::Validate;

use crate::circuit_breaker::{BreakerRegistry, BreakerState};
use crate::error::{DispatchError, InferenceError, PluginError, ValidationError};
use crate::metrics;
use crate::model_runtime::loader::panic_message;
use crate::model_runtime::{ModelRegistry, PluginWork};
use crate::plugin::{BoundingBox, Detection, Frame, ModelKey};

pub const MAX_FRAME_DIMENSION: u32 = 8192;

/// Event type of results produced when the plugin failed.
pub const INFERENCE_ERROR_EVENT: &str = "inference_error";

/// Event type reported when the detection fell below the requested
/// confidence threshold.
pub const NO_EVENT: &str = "none";

fn validate_roi(roi: &BoundingBox) -> Result<(), validator::ValidationError> {
    if roi.is_normalized() && roi.width > 0.0 && roi.height > 0.0 {
        Ok(())
    } else {
        Err(validator::ValidationError::new("roi_not_normalized"))
    }
}

/// Caller-supplied context for one frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct InferenceMetadata {
    #[validate(length(min = 1, max = 128))]
    pub camera_id: String,
    #[validate(range(min = 0.0, max = 1.0))]
    #[serde(default)]
    pub confidence_threshold: Option<f32>,
    /// Region of interest; detections outside it are dropped.
    #[validate(custom = "validate_roi")]
    #[serde(default)]
    pub roi: Option<BoundingBox>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

impl InferenceMetadata {
    pub fn for_camera(camera_id: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub model_id: String,
    pub version: String,
    pub camera_id: String,
    pub event_type: String,
    pub confidence: f32,
    pub bounding_boxes: Vec<BoundingBox>,
    pub metadata: Map<String, Value>,
    pub status: ResultStatus,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl DetectionResult {
    fn from_detection(
        key: &ModelKey,
        detection: Detection,
        request: &InferenceMetadata,
        latency_ms: u64,
    ) -> Self {
        let mut bounding_boxes = detection.bounding_boxes;
        if let Some(roi) = &request.roi {
            bounding_boxes.retain(|b| b.intersects(roi));
        }

        let mut metadata = detection.metadata;
        let below_threshold = request
            .confidence_threshold
            .map_or(false, |threshold| detection.confidence < threshold);
        let event_type = if below_threshold {
            metadata.insert("suppressed_event".into(), json!(detection.event_type));
            NO_EVENT.to_string()
        } else {
            detection.event_type
        };

        Self {
            model_id: key.model_id.clone(),
            version: key.version.to_string(),
            camera_id: request.camera_id.clone(),
            event_type,
            confidence: detection.confidence,
            bounding_boxes,
            metadata,
            status: ResultStatus::Ok,
            latency_ms,
            created_at: Utc::now(),
        }
    }

    fn degraded(
        key: &ModelKey,
        error: &InferenceError,
        frame: &Frame,
        request: &InferenceMetadata,
        latency_ms: u64,
    ) -> Self {
        let mut metadata = Map::new();
        metadata.insert("error".into(), json!(error.to_string()));
        metadata.insert("fallback".into(), json!("hash"));
        metadata.insert(
            "frame_hash".into(),
            json!(blake3::hash(&frame.data).to_hex().to_string()),
        );

        Self {
            model_id: key.model_id.clone(),
            version: key.version.to_string(),
            camera_id: request.camera_id.clone(),
            event_type: INFERENCE_ERROR_EVENT.to_string(),
            confidence: 0.0,
            bounding_boxes: Vec::new(),
            metadata,
            status: ResultStatus::Degraded,
            latency_ms,
            created_at: Utc::now(),
        }
    }
}

pub fn validate_frame(frame: &Frame) -> Result<(), ValidationError> {
    let dims = 1..=MAX_FRAME_DIMENSION;
    if !dims.contains(&frame.width) || !dims.contains(&frame.height) {
        return Err(ValidationError::Frame(format!(
            "dimensions {}x{} outside 1..={}",
            frame.width, frame.height, MAX_FRAME_DIMENSION
        )));
    }
    if !matches!(frame.channels, 1 | 3 | 4) {
        return Err(ValidationError::Frame(format!(
            "unsupported channel count {}",
            frame.channels
        )));
    }
    if frame.data.len() != frame.expected_len() {
        return Err(ValidationError::Frame(format!(
            "buffer holds {} bytes, expected {}",
            frame.data.len(),
            frame.expected_len()
        )));
    }
    Ok(())
}

fn validate_output(detection: &Detection) -> Result<(), InferenceError> {
    if detection.event_type.trim().is_empty() {
        return Err(InferenceError::MalformedOutput("empty event type".into()));
    }
    if !detection.confidence.is_finite() || !(0.0..=1.0).contains(&detection.confidence) {
        return Err(InferenceError::MalformedOutput(format!(
            "confidence {} outside [0, 1]",
            detection.confidence
        )));
    }
    if let Some(b) = detection.bounding_boxes.iter().find(|b| !b.is_normalized()) {
        return Err(InferenceError::MalformedOutput(format!(
            "bounding box {:?} not normalized",
            b
        )));
    }
    Ok(())
}

fn at(stage: &'static str) -> impl FnOnce(PluginError) -> InferenceError {
    move |source| InferenceError::Plugin { stage, source }
}

/// `work` moves onto the blocking thread and is dropped there, so the
/// instance cannot be torn down while the plugin is still running.
async fn run_pipeline(work: PluginWork, frame: Frame) -> Result<Detection, InferenceError> {
    let joined = tokio::task::spawn_blocking(move || {
        catch_unwind(AssertUnwindSafe(|| {
            let handle = work.handle();
            let tensor = handle.preprocess(&frame).map_err(at("preprocess"))?;
            let raw = handle.infer(&tensor).map_err(at("inference"))?;
            handle.postprocess(raw).map_err(at("postprocess"))
        }))
    })
    .await;

    let detection = match joined {
        Ok(Ok(result)) => result?,
        Ok(Err(payload)) => return Err(InferenceError::Panicked(panic_message(payload.as_ref()))),
        Err(e) => return Err(InferenceError::Panicked(e.to_string())),
    };
    validate_output(&detection)?;
    Ok(detection)
}

pub struct InferenceDispatcher {
    registry: Arc<ModelRegistry>,
    breakers: Arc<BreakerRegistry>,
    slots: Arc<Semaphore>,
    timeout: Duration,
}

impl InferenceDispatcher {
    pub fn new(
        registry: Arc<ModelRegistry>,
        breakers: Arc<BreakerRegistry>,
        max_concurrent: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            breakers,
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.timeout
    }

    /// Inference slots currently free.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn infer(
        &self,
        model_id: &str,
        version: Option<&str>,
        frame: Frame,
        metadata: InferenceMetadata,
    ) -> Result<DetectionResult, DispatchError> {
        self.infer_with_timeout(model_id, version, frame, metadata, self.timeout)
            .await
    }

    /// Like [`infer`](Self::infer) with an explicit deadline. On expiry the
    /// lease, slot and breaker permit are dropped. Plugin work that already
    /// started runs to completion and its result is discarded; unloading the
    /// instance waits for it.
    pub async fn infer_with_timeout(
        &self,
        model_id: &str,
        version: Option<&str>,
        frame: Frame,
        metadata: InferenceMetadata,
        timeout: Duration,
    ) -> Result<DetectionResult, DispatchError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.dispatch(model_id, version, frame, metadata, started)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(model_id = %model_id, "Inference timed out after {:?}", timeout);
                metrics::inc_inference(model_id, "timeout");
                Err(DispatchError::Timeout(timeout))
            }
        }
    }

    async fn dispatch(
        &self,
        model_id: &str,
        version: Option<&str>,
        frame: Frame,
        metadata: InferenceMetadata,
        started: Instant,
    ) -> Result<DetectionResult, DispatchError> {
        // The semaphore is never closed, so this only waits.
        let _slot = self.slots.acquire().await;

        let lease = self.registry.lease(model_id, version).await?;
        let key = lease.key();
        let breaker = self.breakers.get(&key);
        let permit = breaker.try_acquire().map_err(|e| {
            metrics::inc_inference(&key.to_string(), "rejected");
            e
        })?;

        metadata.validate().map_err(ValidationError::Metadata)?;
        validate_frame(&frame)?;

        let instance = Arc::clone(&lease);
        let work = instance.begin_work().await;
        let outcome = run_pipeline(work, frame.clone()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(detection) => {
                let transition = permit.success();
                instance.record_inference(&metadata.camera_id, true);
                metrics::inc_inference(&key.to_string(), "ok");
                self.apply_transition(&key, transition);
                debug!(
                    model_id = %key.model_id,
                    version = %key.version,
                    "{} ({:.2}) in {}ms",
                    detection.event_type,
                    detection.confidence,
                    latency_ms
                );
                Ok(DetectionResult::from_detection(&key, detection, &metadata, latency_ms))
            }
            Err(e) => {
                let transition = permit.failure();
                instance.record_inference(&metadata.camera_id, false);
                metrics::inc_inference(&key.to_string(), "error");
                self.apply_transition(&key, transition);
                warn!(
                    model_id = %key.model_id,
                    version = %key.version,
                    camera_id = %metadata.camera_id,
                    "Inference failed, returning degraded result: {}",
                    e
                );
                Ok(DetectionResult::degraded(&key, &e, &frame, &metadata, latency_ms))
            }
        }
    }

    /// Mirror breaker transitions into the registry status. Runs as its own
    /// task because the caller still holds a read lease; the task applies
    /// whatever state the breaker is in when it runs.
    fn apply_transition(&self, key: &ModelKey, transition: Option<BreakerState>) {
        if !matches!(transition, Some(BreakerState::Open | BreakerState::Closed)) {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let breakers = Arc::clone(&self.breakers);
        let key = key.clone();
        tokio::spawn(async move {
            registry.sync_breaker_status(&key, &breakers).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::BreakerConfig;
    use crate::model_runtime::{ModelLoader, ModelStatus};
    use crate::plugin::test_support::{descriptor_for, ScriptedPlugin};
    use crate::plugin::PluginCatalog;
    use crate::resources::{DeviceId, DeviceSpec, ResourceManager};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        plugin: Arc<ScriptedPlugin>,
        registry: Arc<ModelRegistry>,
        breakers: Arc<BreakerRegistry>,
        dispatcher: InferenceDispatcher,
    }

    async fn harness(versions: &[&str], breaker: BreakerConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let resources = Arc::new(
            ResourceManager::new(vec![DeviceSpec { id: DeviceId::Gpu(0), total_mb: 16384 }]).unwrap(),
        );
        let registry = Arc::new(ModelRegistry::new(resources));
        let plugin = ScriptedPlugin::new();
        let mut catalog = PluginCatalog::new();
        catalog.register("fall_detection", plugin.clone());
        let loader = ModelLoader::new(Arc::new(catalog), registry.clone());

        for version in versions {
            let mut d = descriptor_for("fall_detection", version);
            d.weights_path = dir.path().join(version);
            std::fs::create_dir_all(&d.weights_path).unwrap();
            loader.load(Arc::new(d)).await.unwrap();
        }

        let breakers = Arc::new(BreakerRegistry::in_memory(breaker));
        let dispatcher = InferenceDispatcher::new(
            registry.clone(),
            breakers.clone(),
            4,
            Duration::from_secs(2),
        );
        Harness {
            _dir: dir,
            plugin,
            registry,
            breakers,
            dispatcher,
        }
    }

    fn frame() -> Frame {
        Frame::new(2, 2, 1, vec![10u8, 20, 30, 40])
    }

    fn meta() -> InferenceMetadata {
        InferenceMetadata::for_camera("cam-1")
    }

    fn threshold(n: u32, cooldown: Duration) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: n,
            cooldown,
            max_cooldown: cooldown * 8,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_successful_inference() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();

        assert_eq!(result.status, ResultStatus::Ok);
        assert_eq!(result.event_type, "fall");
        assert_eq!(result.version, "1.0.0");
        assert_eq!(result.camera_id, "cam-1");

        let instance = h.registry.get("fall_detection", None).await.unwrap();
        assert_eq!(instance.inference_count(), 1);
        assert_eq!(instance.cameras_active(Duration::from_secs(60)), 1);
        assert_eq!(h.dispatcher.available_slots(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inferences_share_instance() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        h.plugin.infer_delay_ms.store(10, Ordering::SeqCst);

        let calls = (0..12).map(|i| {
            h.dispatcher.infer(
                "fall_detection",
                None,
                frame(),
                InferenceMetadata::for_camera(format!("cam-{}", i % 3)),
            )
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.as_ref().map_or(false, |r| r.status == ResultStatus::Ok)));
        assert_eq!(h.plugin.inference_count(), 12);
        assert_eq!(h.dispatcher.available_slots(), 4);
        let instance = h.registry.get("fall_detection", None).await.unwrap();
        assert_eq!(instance.cameras_active(Duration::from_secs(60)), 3);
    }

    #[tokio::test]
    async fn test_unversioned_request_uses_default() {
        let h = harness(&["1.0.0", "1.1.0"], BreakerConfig::default()).await;
        h.registry
            .set_default_version("fall_detection", semver::Version::new(1, 1, 0))
            .await;
        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        assert_eq!(result.version, "1.1.0");
    }

    #[tokio::test]
    async fn test_failure_degrades_with_frame_hash() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        h.plugin.fail_infer.store(true, Ordering::SeqCst);

        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        assert_eq!(result.status, ResultStatus::Degraded);
        assert_eq!(result.event_type, INFERENCE_ERROR_EVENT);
        assert_eq!(result.confidence, 0.0);
        assert_eq!(result.metadata["fallback"], "hash");
        assert_eq!(
            result.metadata["frame_hash"],
            blake3::hash(&[10u8, 20, 30, 40]).to_hex().to_string()
        );
        assert!(result.metadata["error"].as_str().unwrap().contains("scripted failure"));
    }

    #[tokio::test]
    async fn test_panic_and_malformed_output_degrade() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;

        h.plugin.panic_infer.store(true, Ordering::SeqCst);
        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        assert_eq!(result.status, ResultStatus::Degraded);
        assert!(result.metadata["error"].as_str().unwrap().contains("panicked"));

        h.plugin.panic_infer.store(false, Ordering::SeqCst);
        h.plugin.malformed_output.store(true, Ordering::SeqCst);
        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        assert_eq!(result.status, ResultStatus::Degraded);
        assert!(result.metadata["error"].as_str().unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let h = harness(&["1.0.0"], threshold(5, Duration::from_secs(60))).await;
        h.plugin.fail_infer.store(true, Ordering::SeqCst);

        for _ in 0..5 {
            let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
            assert_eq!(result.status, ResultStatus::Degraded);
        }
        let calls = h.plugin.inference_count();

        let err = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap_err();
        assert!(matches!(err, DispatchError::CircuitOpen(_)));
        assert_eq!(h.plugin.inference_count(), calls);

        // The status flip runs on its own task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let key = ModelKey::new("fall_detection", semver::Version::new(1, 0, 0));
        assert_eq!(h.registry.status_of(&key).await, Some(ModelStatus::Error));
    }

    #[tokio::test]
    async fn test_recovery_closes_breaker_and_reactivates() {
        let h = harness(&["1.0.0"], threshold(1, Duration::from_millis(20))).await;
        h.plugin.fail_infer.store(true, Ordering::SeqCst);
        h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        h.plugin.fail_infer.store(false, Ordering::SeqCst);
        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        assert_eq!(result.status, ResultStatus::Ok);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let key = ModelKey::new("fall_detection", semver::Version::new(1, 0, 0));
        assert_eq!(h.breakers.state_of(&key), BreakerState::Closed);
        assert_eq!(h.registry.status_of(&key).await, Some(ModelStatus::Active));
    }

    #[tokio::test]
    async fn test_validation_rejects_before_plugin() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;

        let bad_frame = Frame::new(2, 2, 3, vec![0u8; 4]);
        let err = h.dispatcher.infer("fall_detection", None, bad_frame, meta()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(ValidationError::Frame(_))));

        let err = h
            .dispatcher
            .infer("fall_detection", None, frame(), InferenceMetadata::for_camera(""))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(ValidationError::Metadata(_))));

        let mut out_of_range = meta();
        out_of_range.confidence_threshold = Some(1.5);
        assert!(h.dispatcher.infer("fall_detection", None, frame(), out_of_range).await.is_err());

        let mut bad_roi = meta();
        bad_roi.roi = Some(BoundingBox { x: 0.9, width: 0.5, ..BoundingBox::full_frame() });
        assert!(h.dispatcher.infer("fall_detection", None, frame(), bad_roi).await.is_err());

        assert_eq!(h.plugin.inference_count(), 0);
    }

    #[tokio::test]
    async fn test_threshold_suppresses_event() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        let mut request = meta();
        request.confidence_threshold = Some(0.95);

        let result = h.dispatcher.infer("fall_detection", None, frame(), request).await.unwrap();
        assert_eq!(result.event_type, NO_EVENT);
        assert_eq!(result.metadata["suppressed_event"], "fall");
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        let err = h.dispatcher.infer("ppe", None, frame(), meta()).await.unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_timeout_releases_everything() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        h.plugin.infer_delay_ms.store(200, Ordering::SeqCst);

        let err = h
            .dispatcher
            .infer_with_timeout("fall_detection", None, frame(), meta(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
        assert_eq!(h.dispatcher.available_slots(), 4);

        // The write path is not blocked by a leaked read lease.
        let unload = tokio::time::timeout(
            Duration::from_secs(1),
            h.registry.unregister("fall_detection", &semver::Version::new(1, 0, 0)),
        )
        .await;
        assert!(matches!(unload, Ok(Ok(()))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unload_waits_for_timed_out_plugin_work() {
        let h = harness(&["1.0.0"], BreakerConfig::default()).await;
        h.plugin.infer_delay_ms.store(300, Ordering::SeqCst);

        let err = h
            .dispatcher
            .infer_with_timeout("fall_detection", None, frame(), meta(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));
        assert_eq!(h.plugin.completed.load(Ordering::SeqCst), 0);

        h.registry
            .unregister("fall_detection", &semver::Version::new(1, 0, 0))
            .await
            .unwrap();
        assert_eq!(h.plugin.completed.load(Ordering::SeqCst), 1);
        assert_eq!(h.plugin.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.resources().outstanding(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_trial_frees_slot() {
        let h = harness(&["1.0.0"], threshold(1, Duration::from_millis(20))).await;
        h.plugin.fail_infer.store(true, Ordering::SeqCst);
        h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        h.plugin.fail_infer.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(40)).await;
        h.plugin.infer_delay_ms.store(200, Ordering::SeqCst);
        let err = h
            .dispatcher
            .infer_with_timeout("fall_detection", None, frame(), meta(), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Timeout(_)));

        h.plugin.infer_delay_ms.store(0, Ordering::SeqCst);
        let result = h.dispatcher.infer("fall_detection", None, frame(), meta()).await.unwrap();
        assert_eq!(result.status, ResultStatus::Ok);
    }

    #[test]
    fn test_frame_validation() {
        assert!(validate_frame(&Frame::new(4, 4, 3, vec![0u8; 48])).is_ok());
        assert!(validate_frame(&Frame::new(0, 4, 3, Vec::<u8>::new())).is_err());
        assert!(validate_frame(&Frame::new(9000, 1, 1, vec![0u8; 9000])).is_err());
        assert!(validate_frame(&Frame::new(1, 1, 2, vec![0u8; 2])).is_err());
    }
}
