use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domains::credits::APPLE_PURCHASE_EXPIRY_DAYS;
use crate::domains::ledger::{CorrelationKey, EntrySource, EntryType, GrantOutcome};
use crate::observability::metrics::record_webhook;
use crate::state::AppState;

// ============================================================================
// MOBILE STORE WEBHOOK - signed notifications (JWS ES256 + x5c chain)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationEnvelope {
    signed_payload: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationPayload {
    notification_type: String,
    #[serde(default)]
    subtype: Option<String>,
    data: NotificationData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationData {
    #[serde(default)]
    bundle_id: Option<String>,
    signed_transaction_info: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionInfo {
    transaction_id: String,
    #[serde(default)]
    original_transaction_id: Option<String>,
    product_id: String,
    #[serde(default = "default_quantity")]
    quantity: i64,
    #[serde(default)]
    app_account_token: Option<String>,
}

fn default_quantity() -> i64 {
    1
}

/// Store notifications. The outer envelope and the inner transaction are
/// independent JWS payloads; both verify against the cached root before
/// anything is trusted. Post-verification failures ack with 200 — the
/// correlation keys make a future replay safe either way.
pub async fn handle(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let envelope: NotificationEnvelope = match serde_json::from_slice(&body) {
        Ok(env) => env,
        Err(e) => {
            record_webhook("store", "malformed");
            warn!("store webhook body unparsable: {}", e);
            return StatusCode::OK;
        }
    };

    let payload: NotificationPayload = match state.store_verifier.verify(&envelope.signed_payload) {
        Ok(p) => p,
        Err(e) => {
            record_webhook("store", "rejected");
            warn!("store notification signature rejected: {}", e);
            return StatusCode::UNAUTHORIZED;
        }
    };

    if let Some(bundle_id) = &payload.data.bundle_id {
        if bundle_id != &state.config.apple.bundle_id {
            record_webhook("store", "rejected");
            warn!(bundle_id, "store notification for foreign bundle");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let transaction = match &payload.data.signed_transaction_info {
        Some(jws) => match state.store_verifier.verify::<TransactionInfo>(jws) {
            Ok(t) => Some(t),
            Err(e) => {
                record_webhook("store", "rejected");
                warn!("store transaction signature rejected: {}", e);
                return StatusCode::UNAUTHORIZED;
            }
        },
        None => None,
    };

    let notification_type = payload.notification_type.as_str();
    match (notification_type, transaction) {
        ("INITIAL_BUY" | "ONE_TIME_CHARGE", Some(tx)) => {
            record_webhook("store", "processed");
            grant_purchase(&state, tx).await
        }
        ("REFUND" | "REVOKE", Some(tx)) => {
            record_webhook("store", "processed");
            apply_refund(&state, tx).await
        }
        ("CONSUMPTION_REQUEST", Some(tx)) => {
            record_webhook("store", "processed");
            let transaction_id =
                tx.original_transaction_id.unwrap_or(tx.transaction_id);
            match state.reporter.report(&transaction_id).await {
                Ok(Some(status)) => {
                    info!(transaction_id, ?status, "consumption answered");
                }
                Ok(None) => {
                    info!(transaction_id, "consumption request before purchase, skipped");
                }
                Err(e) => error!(transaction_id, "consumption report failed: {}", e),
            }
            StatusCode::OK
        }
        (other, _) => {
            record_webhook("store", "ignored");
            info!(
                notification_type = other,
                subtype = payload.subtype.as_deref().unwrap_or(""),
                "store notification acknowledged without effect"
            );
            StatusCode::OK
        }
    }
}

async fn grant_purchase(state: &Arc<AppState>, tx: TransactionInfo) -> StatusCode {
    let Some(photographer_id) =
        tx.app_account_token.as_deref().and_then(|t| Uuid::parse_str(t).ok())
    else {
        error!(
            transaction_id = %tx.transaction_id,
            "store purchase without app account token, cannot attribute"
        );
        return StatusCode::OK;
    };
    let Some(credits_per_unit) = product_credits(&tx.product_id) else {
        error!(product_id = %tx.product_id, "store purchase for unknown product");
        return StatusCode::OK;
    };
    let credits = credits_per_unit * tx.quantity.max(1);

    let result = state
        .ledger
        .grant(
            photographer_id,
            credits,
            EntryType::Purchase,
            EntrySource::ApplePurchase,
            CorrelationKey::AppleTransaction(tx.transaction_id.clone()),
            Some(Utc::now() + Duration::days(APPLE_PURCHASE_EXPIRY_DAYS)),
            None,
        )
        .await;

    match result {
        Ok(GrantOutcome::Granted(entry)) => {
            info!(transaction_id = %tx.transaction_id, credits = entry.amount, "store purchase granted");
        }
        Ok(GrantOutcome::AlreadyGranted(_)) => {
            info!(transaction_id = %tx.transaction_id, "store purchase replayed, already granted");
        }
        Err(e) => error!(transaction_id = %tx.transaction_id, "store grant failed: {}", e),
    }
    StatusCode::OK
}

/// A refund arriving before its purchase finds no grant: log and ack, the
/// store retries the whole pair and the purchase lands first next time.
async fn apply_refund(state: &Arc<AppState>, tx: TransactionInfo) -> StatusCode {
    let refunded_id = tx.transaction_id.clone();
    let original = state
        .ledger
        .find_by_correlation(&CorrelationKey::AppleTransaction(refunded_id.clone()))
        .await;

    let original = match original {
        Ok(Some(entry)) if entry.amount > 0 => entry,
        Ok(_) => {
            info!(
                transaction_id = %refunded_id,
                "refund before purchase, acknowledged without effect"
            );
            return StatusCode::OK;
        }
        Err(e) => {
            error!(transaction_id = %refunded_id, "refund lookup failed: {}", e);
            return StatusCode::OK;
        }
    };

    // The negative entry carries the original grant's expiry so the class
    // arithmetic and the post-expiry balance stay consistent.
    let result = state
        .ledger
        .grant(
            original.photographer_id,
            -original.amount,
            EntryType::Refund,
            EntrySource::Refund,
            CorrelationKey::AppleTransaction(refund_correlation(&refunded_id)),
            original.expires_at,
            None,
        )
        .await;

    match result {
        Ok(GrantOutcome::Granted(entry)) => {
            info!(transaction_id = %refunded_id, amount = entry.amount, "refund applied");
        }
        Ok(GrantOutcome::AlreadyGranted(_)) => {
            info!(transaction_id = %refunded_id, "refund replayed, already applied");
        }
        Err(e) => error!(transaction_id = %refunded_id, "refund grant failed: {}", e),
    }
    StatusCode::OK
}

/// Consumable products encode their credit count: `credits_100` grants 100.
fn product_credits(product_id: &str) -> Option<i64> {
    let count = product_id.strip_prefix("credits_")?.parse::<i64>().ok()?;
    (count > 0).then_some(count)
}

/// The refund row shares the transaction id column with the grant, so its
/// correlation value is namespaced to keep both unique.
fn refund_correlation(transaction_id: &str) -> String {
    format!("{}:refund", transaction_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_credits_parsing() {
        assert_eq!(product_credits("credits_100"), Some(100));
        assert_eq!(product_credits("credits_25"), Some(25));
        assert_eq!(product_credits("credits_0"), None);
        assert_eq!(product_credits("premium_monthly"), None);
        assert_eq!(product_credits("credits_abc"), None);
    }

    #[test]
    fn test_refund_correlation_differs_from_grant() {
        assert_eq!(refund_correlation("tx_B"), "tx_B:refund");
        assert_ne!(refund_correlation("tx_B"), "tx_B");
    }

    #[test]
    fn test_transaction_info_deserializes_store_shape() {
        let json = serde_json::json!({
            "transactionId": "2000000123",
            "originalTransactionId": "2000000123",
            "productId": "credits_100",
            "quantity": 2,
            "appAccountToken": "3e6f6b8e-3c2f-4a8e-9c1d-2f6f0a1b2c3d"
        });
        let tx: TransactionInfo = serde_json::from_value(json).unwrap();
        assert_eq!(tx.quantity, 2);
        assert_eq!(tx.product_id, "credits_100");

        let minimal = serde_json::json!({
            "transactionId": "2000000124",
            "productId": "credits_25"
        });
        let tx: TransactionInfo = serde_json::from_value(minimal).unwrap();
        assert_eq!(tx.quantity, 1);
        assert!(tx.app_account_token.is_none());
    }
}
