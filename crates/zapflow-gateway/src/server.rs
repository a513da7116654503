//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post, put},
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use zapflow_core::config::GatewayConfig;
use zapflow_scheduler::DispatchEngine;

use crate::routes;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub gateway_config: GatewayConfig,
    pub start_time: std::time::Instant,
    /// Owns the store and every running dispatch loop.
    pub engine: DispatchEngine,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    Router::new()
        .route("/health", get(routes::health_check))
        .route(
            "/api/v1/instances",
            get(routes::list_instances).post(routes::register_instance),
        )
        .route("/api/v1/instances/{id}/connection", put(routes::set_connection))
        .route("/api/v1/jobs", get(routes::list_jobs).post(routes::create_job))
        .route("/api/v1/jobs/{id}", get(routes::get_job))
        .route("/api/v1/jobs/{id}/items", post(routes::add_items))
        .route("/api/v1/jobs/{id}/start", post(routes::start_job))
        .route("/api/v1/jobs/{id}/pause", post(routes::pause_job))
        .route("/api/v1/jobs/{id}/resume", post(routes::resume_job))
        .route("/api/v1/jobs/{id}/stop", post(routes::stop_job))
        .route("/api/v1/jobs/{id}/stats", get(routes::job_stats))
        .route("/api/v1/warming/{id}/plan", post(routes::plan_warming))
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: ZAPFLOW_CORS_ORIGINS=https://painel.example.com
            if let Ok(origins_str) = std::env::var("ZAPFLOW_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, engine: DispatchEngine) -> anyhow::Result<()> {
    let state = AppState {
        gateway_config: config.clone(),
        start_time: std::time::Instant::now(),
        engine,
    };
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
