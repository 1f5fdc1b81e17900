use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domains::credits::PURCHASE_EXPIRY_DAYS;
use crate::domains::ledger::{CorrelationKey, EntrySource, EntryType, GrantOutcome, LedgerError, LedgerService};
use crate::error::is_transient;
use crate::observability::metrics::record_webhook;
use crate::state::AppState;
use crate::webhook::signature::verify_stripe_signature;

// ============================================================================
// PAYMENT GATEWAY WEBHOOK
// ============================================================================

/// Payment gateway events. The body is consumed as raw bytes and the
/// signature is checked over exactly those bytes before any parsing.
/// Transient storage trouble answers 500 so the gateway redelivers;
/// everything else answers 200 to keep the retry channel clear.
pub async fn handle(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(signature) = headers.get("Stripe-Signature").and_then(|v| v.to_str().ok()) else {
        record_webhook("payment", "rejected");
        warn!("payment webhook without signature header");
        return StatusCode::UNAUTHORIZED;
    };

    if let Err(e) = verify_stripe_signature(
        &state.config.stripe.webhook_secret,
        &body,
        signature,
        Utc::now().timestamp(),
    ) {
        record_webhook("payment", "rejected");
        warn!("payment webhook signature rejected: {}", e);
        return StatusCode::UNAUTHORIZED;
    }

    let event: Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(e) => {
            record_webhook("payment", "malformed");
            error!("payment webhook unparsable after valid signature: {}", e);
            return StatusCode::OK;
        }
    };

    let event_type = event["type"].as_str().unwrap_or("");
    let event_id = event["id"].as_str().unwrap_or("");

    match event_type {
        "checkout.session.completed" => match fulfill_checkout(&state, &event).await {
            Ok(()) => {
                record_webhook("payment", "processed");
                StatusCode::OK
            }
            Err(FulfillError::Transient(e)) => {
                record_webhook("payment", "retried");
                error!(event_id, "transient failure fulfilling checkout, requesting redelivery: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Err(FulfillError::Permanent(e)) => {
                record_webhook("payment", "malformed");
                error!(event_id, "permanently unfulfillable checkout event: {}", e);
                StatusCode::OK
            }
        },
        "checkout.session.expired" => {
            record_webhook("payment", "processed");
            expire_session(&state, &event).await;
            StatusCode::OK
        }
        // No ledger effect; logged for operator visibility.
        "payment_intent.succeeded"
        | "payment_intent.payment_failed"
        | "customer.created"
        | "customer.updated"
        | "customer.deleted" => {
            record_webhook("payment", "processed");
            info!(event_id, event_type, "payment event acknowledged");
            StatusCode::OK
        }
        other => {
            record_webhook("payment", "ignored");
            info!(event_id, event_type = other, "unhandled payment event type");
            StatusCode::OK
        }
    }
}

enum FulfillError {
    Transient(String),
    Permanent(String),
}

impl From<sqlx::Error> for FulfillError {
    fn from(e: sqlx::Error) -> Self {
        if is_transient(&e) {
            FulfillError::Transient(e.to_string())
        } else {
            FulfillError::Permanent(e.to_string())
        }
    }
}

impl From<LedgerError> for FulfillError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Database(db) => db.into(),
            other => FulfillError::Permanent(other.to_string()),
        }
    }
}

/// Grant the purchased credits, mark the session fulfilled, and settle any
/// gift-code bonus — all in one transaction keyed by the session id.
async fn fulfill_checkout(state: &Arc<AppState>, event: &Value) -> Result<(), FulfillError> {
    let object = &event["data"]["object"];
    let session_id = object["id"]
        .as_str()
        .ok_or_else(|| FulfillError::Permanent("checkout event without session id".to_string()))?;
    let (photographer_id, credits) = extract_metadata(object).ok_or_else(|| {
        FulfillError::Permanent("checkout metadata missing photographer_id/credits".to_string())
    })?;

    let mut tx = state.db_pool.begin().await?;

    let outcome = LedgerService::grant_in_tx(
        &mut tx,
        photographer_id,
        credits,
        EntryType::Purchase,
        EntrySource::Purchase,
        CorrelationKey::StripeSession(session_id.to_string()),
        Some(Utc::now() + Duration::days(PURCHASE_EXPIRY_DAYS)),
        None,
    )
    .await?;

    sqlx::query(
        "UPDATE checkout_sessions SET status = 'completed' WHERE session_id = $1 AND status = 'open'",
    )
    .bind(session_id)
    .execute(&mut *tx)
    .await?;

    // A gift code attached to this session grants its bonus now, keyed by
    // the usage row so a replay cannot double-grant.
    let gift: Option<(Uuid, Option<i64>, Option<i32>, String)> = sqlx::query_as(
        r#"
        SELECT u.id, c.grant_credits, c.grant_expires_days, c.code
        FROM promo_usages u
        JOIN promo_codes c ON c.code = u.code
        WHERE u.stripe_session_id = $1
          AND c.kind = 'gift'
        "#,
    )
    .bind(session_id)
    .fetch_optional(&mut *tx)
    .await?;

    if let Some((usage_id, grant_credits, expires_days, code)) = gift {
        let grant_credits = grant_credits.unwrap_or(0);
        if grant_credits > 0 {
            let expires_at =
                expires_days.map(|days| Utc::now() + Duration::days(days as i64));
            LedgerService::grant_in_tx(
                &mut tx,
                photographer_id,
                grant_credits,
                EntryType::Gift,
                EntrySource::Gift,
                CorrelationKey::GiftRedemption(usage_id),
                expires_at,
                Some(&code),
            )
            .await?;
        }
    }

    tx.commit().await?;

    match outcome {
        GrantOutcome::Granted(entry) => {
            info!(session_id, credits = entry.amount, "purchase credits granted");
        }
        GrantOutcome::AlreadyGranted(_) => {
            info!(session_id, "duplicate checkout delivery, grant already recorded");
        }
    }
    Ok(())
}

async fn expire_session(state: &Arc<AppState>, event: &Value) {
    let Some(session_id) = event["data"]["object"]["id"].as_str() else {
        return;
    };
    let result = sqlx::query(
        "UPDATE checkout_sessions SET status = 'expired' WHERE session_id = $1 AND status = 'open'",
    )
    .bind(session_id)
    .execute(&state.db_pool)
    .await;
    match result {
        Ok(r) if r.rows_affected() > 0 => info!(session_id, "checkout session expired"),
        Ok(_) => {}
        Err(e) => error!(session_id, "failed to expire checkout session: {}", e),
    }
}

/// The gateway serializes metadata values as strings; credits must parse
/// to a positive integer.
fn extract_metadata(object: &Value) -> Option<(Uuid, i64)> {
    let metadata = &object["metadata"];
    let photographer_id =
        metadata["photographer_id"].as_str().and_then(|s| Uuid::parse_str(s).ok())?;
    let credits: i64 = metadata["credits"].as_str().and_then(|s| s.parse().ok())?;
    if credits <= 0 {
        return None;
    }
    Some((photographer_id, credits))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_metadata() {
        let photographer = Uuid::new_v4();
        let object = serde_json::json!({
            "id": "sess_A",
            "metadata": { "photographer_id": photographer.to_string(), "credits": "100" }
        });
        assert_eq!(extract_metadata(&object), Some((photographer, 100)));
    }

    #[test]
    fn test_extract_metadata_rejects_zero_and_missing() {
        let object = serde_json::json!({
            "metadata": { "photographer_id": Uuid::new_v4().to_string(), "credits": "0" }
        });
        assert_eq!(extract_metadata(&object), None);

        let object = serde_json::json!({ "metadata": { "credits": "10" } });
        assert_eq!(extract_metadata(&object), None);
    }
}
