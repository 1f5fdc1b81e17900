use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::compression::{predicate::SizeAbove, CompressionLayer};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod config;
pub mod db;
pub mod domains;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod services;
pub mod state;
pub mod webhook;

use state::AppState;
use webhook::create_webhook_router;

async fn healthz(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<&'static str, error::ApiError> {
    sqlx::query("SELECT 1").execute(&state.db_pool).await?;
    Ok("ok")
}

async fn metrics() -> String {
    observability::metrics::render()
}

pub fn create_app_router(app_state: Arc<AppState>) -> Router {
    let api_router = api::create_api_router(app_state.clone());

    Router::new()
        // External event ingestion (raw body, signature-checked)
        .merge(create_webhook_router())
        // Operational endpoints (no authentication)
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        // Authenticated client surface
        .merge(api_router)
        .with_state(app_state)
        // Webhook payloads and API bodies are small; uploads go straight to
        // object storage and never through this service.
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(
            CompressionLayer::new()
                .gzip(true)
                .deflate(true)
                .compress_when(SizeAbove::new(1024)),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
