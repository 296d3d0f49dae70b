//! Model listing and admin endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ApiError, AppState};
use crate::health_reporter::{HealthSource, ModelCapability};
use crate::model_runtime::{DiscoveryReport, ModelStatusReport};

#[derive(Debug, Serialize)]
pub struct LoadResponse {
    pub model_id: String,
    pub version: String,
    pub device: String,
    pub memory_mb: u64,
}

#[derive(Debug, Deserialize)]
pub struct SetDefaultRequest {
    pub version: String,
}

/// Registered instances with status, health and breaker state.
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelStatusReport>> {
    Json(state.runtime.list_status().await)
}

/// Every discovered version and whether it is loaded.
pub async fn list_discovered(State(state): State<AppState>) -> Json<Vec<ModelCapability>> {
    Json(state.runtime.probe().capabilities().await)
}

pub async fn rescan(State(state): State<AppState>) -> Result<Json<DiscoveryReport>, ApiError> {
    info!("Rescan requested");
    state
        .runtime
        .rescan()
        .await
        .map(Json)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))
}

pub async fn load_model(
    State(state): State<AppState>,
    Path((model_id, version)): Path<(String, String)>,
) -> Result<(StatusCode, Json<LoadResponse>), ApiError> {
    info!(model_id = %model_id, version = %version, "Load requested");
    let instance = state.runtime.load_model(&model_id, &version).await?;
    let allocation = instance.allocation();
    Ok((
        StatusCode::CREATED,
        Json(LoadResponse {
            model_id,
            version,
            device: allocation.device.to_string(),
            memory_mb: allocation.amount_mb,
        }),
    ))
}

pub async fn reload_model(
    State(state): State<AppState>,
    Path((model_id, version)): Path<(String, String)>,
) -> Result<Json<LoadResponse>, ApiError> {
    info!(model_id = %model_id, version = %version, "Reload requested");
    let instance = state.runtime.reload_model(&model_id, &version).await?;
    let allocation = instance.allocation();
    Ok(Json(LoadResponse {
        model_id,
        version,
        device: allocation.device.to_string(),
        memory_mb: allocation.amount_mb,
    }))
}

pub async fn unload_model(
    State(state): State<AppState>,
    Path((model_id, version)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    info!(model_id = %model_id, version = %version, "Unload requested");
    state.runtime.unload_model(&model_id, &version).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn set_default(
    State(state): State<AppState>,
    Path(model_id): Path<String>,
    Json(req): Json<SetDefaultRequest>,
) -> Result<StatusCode, ApiError> {
    state.runtime.set_default(&model_id, &req.version).await?;
    Ok(StatusCode::NO_CONTENT)
}
