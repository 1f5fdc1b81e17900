use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::observability::metrics::record_webhook;
use crate::services::queue::{self, KIND_SETTLE_UPLOAD};
use crate::state::AppState;
use crate::webhook::signature::verify_hmac_hex;

// ============================================================================
// OBJECT STORAGE WEBHOOK - completion events feed the settlement queue
// ============================================================================

#[derive(Debug, Deserialize)]
struct StorageEvent {
    #[serde(default)]
    event_id: Option<String>,
    #[serde(rename = "type")]
    event_type: String,
    object: StorageObject,
}

#[derive(Debug, Deserialize)]
struct StorageObject {
    key: String,
}

/// Storage completion events only enqueue; the settlement worker does the
/// actual work. The queue's (kind, dedup_key) uniqueness absorbs bus
/// redelivery, and a 500 here buys redelivery for transient enqueue trouble.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(signature) = headers.get("X-Storage-Signature").and_then(|v| v.to_str().ok()) else {
        record_webhook("storage", "rejected");
        warn!("storage webhook without signature header");
        return StatusCode::UNAUTHORIZED;
    };

    if let Err(e) = verify_hmac_hex(&state.config.storage.webhook_secret, &body, signature) {
        record_webhook("storage", "rejected");
        warn!("storage webhook signature rejected: {}", e);
        return StatusCode::UNAUTHORIZED;
    }

    let event: StorageEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            record_webhook("storage", "malformed");
            error!("storage webhook unparsable after valid signature: {}", e);
            return StatusCode::OK;
        }
    };

    if event.event_type != "object_created" {
        record_webhook("storage", "ignored");
        info!(event_type = %event.event_type, "storage event acknowledged without effect");
        return StatusCode::OK;
    }

    let dedup_key = event.event_id.as_deref().unwrap_or(&event.object.key);
    let payload = json!({ "object_key": event.object.key });

    match queue::enqueue(&state.db_pool, KIND_SETTLE_UPLOAD, dedup_key, payload).await {
        Ok(fresh) => {
            record_webhook("storage", "processed");
            if fresh {
                info!(object_key = %event.object.key, "settlement job enqueued");
            } else {
                info!(object_key = %event.object.key, "storage event replayed, job already queued");
            }
            StatusCode::OK
        }
        Err(e) => {
            record_webhook("storage", "retried");
            error!(object_key = %event.object.key, "settlement enqueue failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
