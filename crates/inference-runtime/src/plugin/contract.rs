//! Plugin capability set: load, preprocess, infer, postprocess.
//!
//! A plugin is resolved from its descriptor and loaded once per model
//! version. The resulting handle is shared by every concurrent inference
//! call, so every stage takes `&self` and must be a pure function of its
//! input.

use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::descriptor::PluginDescriptor;
use crate::error::PluginError;

/// A raw image frame as delivered by a camera.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub data: Bytes,
}

impl Frame {
    pub fn new(width: u32, height: u32, channels: u8, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            channels,
            data: data.into(),
        }
    }

    /// Number of bytes a well-formed frame of these dimensions carries.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Dense input tensor produced by preprocessing.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self { shape, data }
    }
}

/// Unprocessed model output; interpreted only by the plugin's postprocess.
pub type RawOutput = serde_json::Value;

/// Axis-aligned box in normalized image coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub score: f32,
}

impl BoundingBox {
    pub fn full_frame() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: 1.0,
            height: 1.0,
            label: None,
            score: 0.0,
        }
    }

    /// True when the box lies inside the unit square.
    pub fn is_normalized(&self) -> bool {
        let in_unit = |v: f32| v.is_finite() && (0.0..=1.0).contains(&v);
        in_unit(self.x)
            && in_unit(self.y)
            && in_unit(self.width)
            && in_unit(self.height)
            && self.x + self.width <= 1.0 + f32::EPSILON
            && self.y + self.height <= 1.0 + f32::EPSILON
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.x < other.x + other.width
            && other.x < self.x + self.width
            && self.y < other.y + other.height
            && other.y < self.y + self.height
    }
}

/// Postprocessed plugin output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub event_type: String,
    pub confidence: f32,
    #[serde(default)]
    pub bounding_boxes: Vec<BoundingBox>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Factory side of a plugin.
pub trait ModelPlugin: Send + Sync {
    /// Materialize a model from its weights. Must fail with
    /// [`PluginError::WeightsNotFound`] when the weights are absent.
    fn load(
        &self,
        weights_path: &Path,
        descriptor: &PluginDescriptor,
    ) -> Result<Box<dyn ModelHandle>, PluginError>;
}

/// A loaded, ready-to-infer model.
pub trait ModelHandle: Send + Sync {
    fn preprocess(&self, frame: &Frame) -> Result<Tensor, PluginError>;

    fn infer(&self, input: &Tensor) -> Result<RawOutput, PluginError>;

    fn postprocess(&self, raw: RawOutput) -> Result<Detection, PluginError>;

    /// Called once when the instance is torn down.
    fn unload(&self) {}
}
