use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::domains::credits::{CheckoutCreated, CheckoutError, PurchaseStatus};
use crate::domains::promo::PromoError;
use crate::error::ApiError;
use crate::middleware::CurrentPhotographer;
use crate::state::AppState;

// ============================================================================
// REQUEST / RESPONSE MODELS
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[validate(range(min = 1, max = 10_000))]
    pub amount: i64,
    #[validate(length(min = 1, max = 64))]
    pub promo_code: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub balance: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearest_expiry: Option<DateTime<Utc>>,
}

// ============================================================================
// ERROR TRANSLATION
// ============================================================================

impl From<PromoError> for ApiError {
    fn from(err: PromoError) -> Self {
        match err {
            PromoError::Invalid => ApiError::not_found("Promo code not found"),
            PromoError::Expired => ApiError::gone("Promo code expired"),
            PromoError::AlreadyUsed => ApiError::conflict("Promo code already used"),
            PromoError::NotEligible => ApiError::forbidden("Not eligible for this promo code"),
            PromoError::GloballyExhausted => ApiError::gone("Promo code fully redeemed"),
            PromoError::Database(e) => e.into(),
        }
    }
}

impl From<CheckoutError> for ApiError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::InvalidAmount(_) => {
                ApiError::bad_request("Credit amount outside the allowed range")
            }
            CheckoutError::SessionNotFound => ApiError::not_found("Checkout session not found"),
            CheckoutError::Promo(e) => e.into(),
            CheckoutError::Gateway(e) => {
                tracing::error!("payment gateway error at API boundary: {}", e);
                ApiError::bad_gateway("Payment gateway unavailable")
            }
            CheckoutError::Database(e) => e.into(),
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutCreated>), ApiError> {
    request.validate().map_err(|e| ApiError::bad_request(e.to_string()))?;

    let created = state
        .checkout
        .create_checkout(photographer.id, request.amount, request.promo_code.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn purchase_status(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Path(session_id): Path<String>,
) -> Result<Json<PurchaseStatus>, ApiError> {
    let status =
        state.checkout.purchase_status(photographer.id, &session_id, &state.ledger).await?;
    Ok(Json(status))
}

pub async fn balance(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let detail = state.ledger.balance_detail(photographer.id).await.map_err(|e| match e {
        crate::domains::ledger::LedgerError::Database(db) => db.into(),
        other => {
            tracing::error!("balance computation failed: {}", other);
            ApiError::internal("Internal error")
        }
    })?;
    Ok(Json(BalanceResponse { balance: detail.balance, nearest_expiry: detail.nearest_expiry }))
}

pub fn create_credits_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/credits/checkout", post(create_checkout))
        .route("/credits/purchase/:session_id", get(purchase_status))
        .route("/credits/balance", get(balance))
}
