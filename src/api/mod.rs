pub mod credits;
pub mod uploads;

use axum::{middleware::from_fn_with_state, Router};
use std::sync::Arc;

use crate::middleware::extract_current_photographer;
use crate::state::AppState;

/// Authenticated client surface. Webhooks and operational endpoints live
/// outside this router.
pub fn create_api_router(app_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .merge(uploads::create_uploads_router())
        .merge(credits::create_credits_router())
        .layer(from_fn_with_state(app_state, extract_current_photographer))
}
