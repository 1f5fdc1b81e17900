use crate::state::AppState;
use axum::{routing::post, Router};
use std::sync::Arc;

use super::handlers::{auth_events, payment, storage, store};

/// External event ingestion. These routes take the raw body bytes — no JSON
/// extractor may run before signature verification.
pub fn create_webhook_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/payment", post(payment::handle))
        .route("/webhooks/store", post(store::handle))
        .route("/webhooks/auth", post(auth_events::handle))
        .route("/webhooks/storage", post(storage::handle))
}
