//! HTTP surface over [`RuntimeState`].

pub mod health_api;
pub mod inference_api;
pub mod models_api;

use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::json;

use crate::error::{DispatchError, LoadError, RegistryError, RuntimeError};
use crate::shared_state::RuntimeState;

pub use health_api::{healthz, readyz};
pub use inference_api::{infer, FramePayload, InferQuery, InferRequest};
pub use models_api::{list_discovered, list_models, load_model, reload_model, rescan, set_default, unload_model};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeState>,
}

impl AppState {
    pub fn new(runtime: Arc<RuntimeState>) -> Self {
        Self { runtime }
    }
}

/// Error body plus status. Circuit-open responses carry `Retry-After`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, message)
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            RegistryError::InvalidVersion(_) => Self::unprocessable(e.to_string()),
            RegistryError::Closed => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }
}

impl From<LoadError> for ApiError {
    fn from(e: LoadError) -> Self {
        let status = match &e {
            LoadError::WeightsMissing { .. } => StatusCode::CONFLICT,
            LoadError::AllocationDenied { .. } => StatusCode::INSUFFICIENT_STORAGE,
            LoadError::PluginException { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            LoadError::ShuttingDown { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, e.to_string())
    }
}

impl From<RuntimeError> for ApiError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::NotDiscovered { .. } => Self::new(StatusCode::NOT_FOUND, e.to_string()),
            RuntimeError::InvalidVersion(_) => Self::unprocessable(e.to_string()),
            RuntimeError::Load(e) => e.into(),
            RuntimeError::Registry(e) => e.into(),
            RuntimeError::ShuttingDown => Self::new(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::NotFound(e) => e.into(),
            DispatchError::Validation(e) => Self::unprocessable(e.to_string()),
            DispatchError::Timeout(_) => Self::new(StatusCode::GATEWAY_TIMEOUT, e.to_string()),
            DispatchError::CircuitOpen(open) => {
                let retry_after_secs = open.retry_after.map(|at| {
                    let millis = (at - Utc::now()).num_milliseconds().max(0) as u64;
                    millis.div_ceil(1000).max(1)
                });
                Self {
                    status: StatusCode::SERVICE_UNAVAILABLE,
                    message: open.to_string(),
                    retry_after_secs,
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(json!({ "error": self.message }))).into_response();
        if let Some(secs) = self.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
