//! Liveness and readiness probes.

use axum::{extract::State, http::StatusCode, Json};
use tracing::debug;

use super::AppState;
use crate::health_reporter::Readiness;

/// Process is up.
pub async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.runtime.liveness() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "DOWN")
    }
}

/// 200 when ready to serve inference, 503 with the reasons otherwise.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<Readiness>) {
    let readiness = state.runtime.readiness().await;
    if readiness.ready {
        (StatusCode::OK, Json(readiness))
    } else {
        debug!("Readiness probe failed: {:?}", readiness.reasons);
        (StatusCode::SERVICE_UNAVAILABLE, Json(readiness))
    }
}
