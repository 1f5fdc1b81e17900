use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::domains::promo::PromoError;

// ======================================================================
// CHECKOUT
// ======================================================================

/// Price of one credit in minor units (USD cents).
pub const CREDIT_UNIT_PRICE_MINOR: i64 = 50;

/// Gateway purchases stay spendable for a year; store purchases for six
/// months (the store dictates its own window).
pub const PURCHASE_EXPIRY_DAYS: i64 = 365;
pub const APPLE_PURCHASE_EXPIRY_DAYS: i64 = 183;

pub const MIN_CHECKOUT_CREDITS: i64 = 1;
pub const MAX_CHECKOUT_CREDITS: i64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CheckoutSession {
    pub session_id: String,
    pub photographer_id: Uuid,
    pub credit_amount: i64,
    pub amount_total: i64,
    pub promo_code: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Price breakdown shown to the client before redirecting to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutPreview {
    pub original_amount: i64,
    pub final_amount: i64,
    pub discount_percent: i32,
    pub bonus_credits: i64,
    pub credit_amount: i64,
    pub effective_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutCreated {
    pub checkout_url: String,
    pub session_id: String,
    pub preview: CheckoutPreview,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseStatus {
    pub fulfilled: bool,
    pub credits: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("credit amount {0} outside the allowed range")]
    InvalidAmount(i64),

    #[error("checkout session not found")]
    SessionNotFound,

    #[error(transparent)]
    Promo(#[from] PromoError),

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),
}
