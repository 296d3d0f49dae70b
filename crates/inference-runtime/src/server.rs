//! HTTP server
//!
//! Brings up the runtime, serves the API until Ctrl-C or SIGTERM, then tears
//! the runtime down in order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use crate::api::AppState;
use crate::config::Config;
use crate::shared_state::RuntimeState;

/// Run the runtime and its API until a shutdown signal arrives.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    cfg.print_config();

    let addr = cfg.api_addr()?;
    let runtime = Arc::new(RuntimeState::start(cfg).await?);

    info!("Starting HTTP server on {}", addr);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            runtime.shutdown().await;
            return Err(e).with_context(|| format!("failed to bind API address {}", addr));
        }
    };

    let app = build_router(AppState::new(Arc::clone(&runtime)));
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    runtime.shutdown().await;
    served.context("HTTP server failed")?;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

/// Routes for probes, model admin and inference.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::{
        routing::{delete, get, post, put},
        Router,
    };
    use tower_http::{
        cors::{Any, CorsLayer},
        timeout::TimeoutLayer,
        trace::TraceLayer,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/healthz", get(crate::api::healthz))
        .route("/readyz", get(crate::api::readyz))
        .route("/models", get(crate::api::list_models))
        .route("/models/discovered", get(crate::api::list_discovered))
        .route("/models/rescan", post(crate::api::rescan))
        .route("/models/:model_id/default", put(crate::api::set_default))
        .route("/models/:model_id/:version/load", post(crate::api::load_model))
        .route("/models/:model_id/:version/reload", post(crate::api::reload_model))
        .route("/models/:model_id/:version", delete(crate::api::unload_model))
        .route("/infer/:model_id", post(crate::api::infer))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .with_state(state)
}
