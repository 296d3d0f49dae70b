// In-process runtime metrics. Collected into a prometheus registry; text
// exposition is left to the embedding application.

use prometheus::{IntCounterVec, IntGauge, IntGaugeVec, Registry};
use lazy_static::lazy_static;
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static INFERENCE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static BREAKER_TRANSITIONS: OnceLock<IntCounterVec> = OnceLock::new();
static LOADED_MODELS: OnceLock<IntGauge> = OnceLock::new();
static DEVICE_MEMORY_USED: OnceLock<IntGaugeVec> = OnceLock::new();

pub fn init_metrics() {
    let inference_total = INFERENCE_TOTAL.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("inference_total", "Inference calls per model and outcome"),
            &["model", "outcome"],
        )
        .expect("valid inference_total metric")
    });

    let breaker_transitions = BREAKER_TRANSITIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("breaker_transitions_total", "Circuit breaker state changes"),
            &["model", "state"],
        )
        .expect("valid breaker_transitions_total metric")
    });

    let loaded_models = LOADED_MODELS.get_or_init(|| {
        IntGauge::new("loaded_models", "Model instances in the registry")
            .expect("valid loaded_models metric")
    });

    let device_memory = DEVICE_MEMORY_USED.get_or_init(|| {
        IntGaugeVec::new(
            prometheus::opts!("device_memory_used_mb", "Reserved memory per device"),
            &["device"],
        )
        .expect("valid device_memory_used_mb metric")
    });

    REGISTRY.register(Box::new(inference_total.clone())).ok();
    REGISTRY.register(Box::new(breaker_transitions.clone())).ok();
    REGISTRY.register(Box::new(loaded_models.clone())).ok();
    REGISTRY.register(Box::new(device_memory.clone())).ok();
}

pub fn inc_inference(model: &str, outcome: &str) {
    if let Some(counter) = INFERENCE_TOTAL.get() {
        counter.with_label_values(&[model, outcome]).inc();
    }
}

pub fn inc_breaker_transition(model: &str, state: &str) {
    if let Some(counter) = BREAKER_TRANSITIONS.get() {
        counter.with_label_values(&[model, state]).inc();
    }
}

pub fn set_loaded_models(count: usize) {
    if let Some(gauge) = LOADED_MODELS.get() {
        gauge.set(count as i64);
    }
}

pub fn set_device_memory(device: &str, used_mb: u64) {
    if let Some(gauge) = DEVICE_MEMORY_USED.get() {
        gauge.with_label_values(&[device]).set(used_mb as i64);
    }
}

/// Gathered metric families, for embedding applications that expose them.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_after_init() {
        init_metrics();
        inc_inference("fall_detection@1.0.0", "ok");
        inc_inference("fall_detection@1.0.0", "ok");
        set_loaded_models(3);

        let families = gather();
        let inference = families
            .iter()
            .find(|f| f.get_name() == "inference_total")
            .unwrap();
        let total: f64 = inference
            .get_metric()
            .iter()
            .map(|m| m.get_counter().get_value())
            .sum();
        assert!(total >= 2.0);
    }

    #[test]
    fn test_noop_is_safe() {
        set_device_memory("cuda:0", 10);
        inc_breaker_transition("m@1.0.0", "open");
    }
}
