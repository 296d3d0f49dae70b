//! Plugins shipped with the runtime.

use std::path::Path;

use serde::Deserialize;
use serde_json::json;

use super::contract::{BoundingBox, Detection, Frame, ModelHandle, ModelPlugin, RawOutput, Tensor};
use super::descriptor::PluginDescriptor;
use crate::error::PluginError;

/// Activity detector based on pixel intensity statistics.
///
/// The weights file only has to exist; its presence marks the model as
/// deployed. Behavior is driven by the descriptor params:
/// `{"threshold": 0.5, "active_level": 0.5, "event_type": "activity"}`.
pub struct FrameStatsPlugin;

impl FrameStatsPlugin {
    pub const NAME: &'static str = "frame_stats";
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct FrameStatsParams {
    threshold: f32,
    active_level: f32,
    event_type: Option<String>,
}

impl Default for FrameStatsParams {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            active_level: 0.5,
            event_type: None,
        }
    }
}

impl ModelPlugin for FrameStatsPlugin {
    fn load(
        &self,
        weights_path: &Path,
        descriptor: &PluginDescriptor,
    ) -> Result<Box<dyn ModelHandle>, PluginError> {
        if !weights_path.exists() {
            return Err(PluginError::WeightsNotFound(weights_path.to_path_buf()));
        }

        let params: FrameStatsParams = if descriptor.params.is_null() {
            FrameStatsParams::default()
        } else {
            serde_json::from_value(descriptor.params.clone())
                .map_err(|e| PluginError::failed(format!("invalid params: {}", e)))?
        };

        let event_type = params
            .event_type
            .clone()
            .or_else(|| descriptor.event_types.first().cloned())
            .unwrap_or_else(|| descriptor.model_id.clone());

        Ok(Box::new(FrameStatsModel { params, event_type }))
    }
}

struct FrameStatsModel {
    params: FrameStatsParams,
    event_type: String,
}

impl ModelHandle for FrameStatsModel {
    fn preprocess(&self, frame: &Frame) -> Result<Tensor, PluginError> {
        if frame.data.len() != frame.expected_len() {
            return Err(PluginError::InvalidInput(format!(
                "expected {} bytes, got {}",
                frame.expected_len(),
                frame.data.len()
            )));
        }
        let data = frame.data.iter().map(|b| *b as f32 / 255.0).collect();
        Ok(Tensor::new(
            vec![
                frame.height as usize,
                frame.width as usize,
                frame.channels as usize,
            ],
            data,
        ))
    }

    fn infer(&self, input: &Tensor) -> Result<RawOutput, PluginError> {
        if input.data.is_empty() {
            return Err(PluginError::InvalidInput("empty tensor".to_string()));
        }
        let n = input.data.len() as f32;
        let mean = input.data.iter().sum::<f32>() / n;
        let active = input
            .data
            .iter()
            .filter(|v| **v >= self.params.active_level)
            .count() as f32;
        Ok(json!({ "mean": mean, "active_ratio": active / n }))
    }

    fn postprocess(&self, raw: RawOutput) -> Result<Detection, PluginError> {
        let active_ratio = raw
            .get("active_ratio")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| PluginError::failed("raw output lacks active_ratio"))?
            as f32;
        let mean = raw.get("mean").and_then(|v| v.as_f64()).unwrap_or_default();

        let mut metadata = serde_json::Map::new();
        metadata.insert("mean_intensity".to_string(), json!(mean));
        metadata.insert("active_ratio".to_string(), json!(active_ratio));

        if active_ratio >= self.params.threshold {
            Ok(Detection {
                event_type: self.event_type.clone(),
                confidence: active_ratio.clamp(0.0, 1.0),
                bounding_boxes: vec![BoundingBox {
                    label: Some(self.event_type.clone()),
                    score: active_ratio.clamp(0.0, 1.0),
                    ..BoundingBox::full_frame()
                }],
                metadata,
            })
        } else {
            Ok(Detection {
                event_type: "none".to_string(),
                confidence: (1.0 - active_ratio).clamp(0.0, 1.0),
                bounding_boxes: Vec::new(),
                metadata,
            })
        }
    }
}
