//! Inference endpoint. Frame bytes travel base64-encoded in JSON.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, AppState};
use crate::dispatcher::{DetectionResult, InferenceMetadata};
use crate::plugin::Frame;

#[derive(Debug, Deserialize)]
pub struct FramePayload {
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_channels")]
    pub channels: u8,
    /// Base64 of the raw pixel bytes.
    pub data: String,
}

fn default_channels() -> u8 {
    3
}

impl FramePayload {
    pub fn decode(self) -> Result<Frame, ApiError> {
        let data = STANDARD
            .decode(self.data.as_bytes())
            .map_err(|e| ApiError::unprocessable(format!("frame data is not valid base64: {}", e)))?;
        Ok(Frame::new(self.width, self.height, self.channels, data))
    }
}

#[derive(Debug, Deserialize)]
pub struct InferRequest {
    pub frame: FramePayload,
    pub metadata: InferenceMetadata,
}

#[derive(Debug, Default, Deserialize)]
pub struct InferQuery {
    pub version: Option<String>,
    /// Overrides the configured inference timeout.
    pub timeout_ms: Option<u64>,
}

pub async fn infer(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Query(query): Query<InferQuery>,
    Json(req): Json<InferRequest>,
) -> Result<Json<DetectionResult>, ApiError> {
    let frame = req.frame.decode()?;
    debug!(
        model_id = %model_id,
        camera_id = %req.metadata.camera_id,
        "Inference request {}x{}x{}",
        frame.width,
        frame.height,
        frame.channels
    );

    let dispatcher = state.runtime.dispatcher();
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| dispatcher.default_timeout());
    let result = dispatcher
        .infer_with_timeout(&model_id, query.version.as_deref(), frame, req.metadata, timeout)
        .await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_payload_decodes_base64() {
        let payload: InferRequest = serde_json::from_value(serde_json::json!({
            "frame": {"width": 2, "height": 1, "channels": 1, "data": STANDARD.encode([7u8, 9])},
            "metadata": {"camera_id": "cam-1", "confidence_threshold": 0.4}
        }))
        .unwrap();
        assert_eq!(payload.metadata.confidence_threshold, Some(0.4));

        let frame = payload.frame.decode().unwrap();
        assert_eq!(&frame.data[..], &[7u8, 9]);
        assert_eq!(frame.expected_len(), 2);
    }

    #[test]
    fn test_channels_default_to_rgb() {
        let payload: FramePayload =
            serde_json::from_str(r#"{"width": 1, "height": 1, "data": "AAAA"}"#).unwrap();
        assert_eq!(payload.decode().unwrap().channels, 3);
    }

    #[test]
    fn test_invalid_base64_is_unprocessable() {
        let payload = FramePayload {
            width: 1,
            height: 1,
            channels: 1,
            data: "***".into(),
        };
        let err = payload.decode().unwrap_err();
        assert_eq!(err.status, StatusCode::UNPROCESSABLE_ENTITY);
    }
}
