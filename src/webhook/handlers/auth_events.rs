use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::observability::metrics::record_webhook;
use crate::state::AppState;
use crate::webhook::signature::verify_hmac_hex;

// ============================================================================
// AUTH PROVIDER WEBHOOK - photographer lifecycle
// ============================================================================

#[derive(Debug, Deserialize)]
struct AuthEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: AuthUserData,
}

#[derive(Debug, Deserialize)]
struct AuthUserData {
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(signature) = headers.get("X-Auth-Signature").and_then(|v| v.to_str().ok()) else {
        record_webhook("auth", "rejected");
        warn!("auth webhook without signature header");
        return StatusCode::UNAUTHORIZED;
    };

    if let Err(e) = verify_hmac_hex(&state.config.auth.webhook_secret, &body, signature) {
        record_webhook("auth", "rejected");
        warn!("auth webhook signature rejected: {}", e);
        return StatusCode::UNAUTHORIZED;
    }

    let event: AuthEvent = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            record_webhook("auth", "malformed");
            error!("auth webhook unparsable after valid signature: {}", e);
            return StatusCode::OK;
        }
    };

    let result = match event.event_type.as_str() {
        // Upsert keyed on the external auth id: creation replays and
        // profile updates take the same path.
        "user.created" | "user.updated" => {
            sqlx::query(
                r#"
                INSERT INTO photographers (auth_user_id, email, display_name)
                VALUES ($1, $2, $3)
                ON CONFLICT (auth_user_id) DO UPDATE
                SET email = EXCLUDED.email,
                    display_name = EXCLUDED.display_name
                "#,
            )
            .bind(&event.data.id)
            .bind(event.data.email.as_deref().unwrap_or(""))
            .bind(event.data.display_name.as_deref())
            .execute(&state.db_pool)
            .await
        }
        "user.deleted" => {
            sqlx::query(
                "UPDATE photographers SET deleted_at = NOW() WHERE auth_user_id = $1 AND deleted_at IS NULL",
            )
            .bind(&event.data.id)
            .execute(&state.db_pool)
            .await
        }
        other => {
            record_webhook("auth", "ignored");
            info!(event_type = other, "auth event acknowledged without effect");
            return StatusCode::OK;
        }
    };

    match result {
        Ok(_) => {
            record_webhook("auth", "processed");
            info!(event_type = %event.event_type, auth_user_id = %event.data.id, "auth event applied");
            StatusCode::OK
        }
        Err(e) => {
            record_webhook("auth", "retried");
            error!(event_type = %event.event_type, "auth event failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
