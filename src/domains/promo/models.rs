use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

// ======================================================================
// PROMO CODES
// ======================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub code: String,
    pub kind: String,
    pub grant_credits: Option<i64>,
    pub grant_expires_days: Option<i32>,
    pub percent_off: Option<i32>,
    pub amount_off_minor: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub max_redemptions: Option<i32>,
    pub max_redemptions_per_user: i32,
    pub target_photographer_ids: Option<Vec<Uuid>>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn allows(&self, photographer_id: Uuid) -> bool {
        match &self.target_photographer_ids {
            Some(targets) => targets.contains(&photographer_id),
            None => true,
        }
    }
}

/// The effect a valid code has on a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedPromo {
    /// Free credits granted on top of the purchase once it completes.
    Gift { grant_credits: i64, expires_days: Option<i32> },
    /// Reduction of the payable amount.
    Discount { percent_off: Option<i32>, amount_off_minor: Option<i64> },
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoUsage {
    pub id: Uuid,
    pub code: String,
    pub photographer_id: Uuid,
    pub stripe_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum PromoError {
    #[error("promo code not found or inactive")]
    Invalid,

    #[error("promo code expired")]
    Expired,

    #[error("promo code already used")]
    AlreadyUsed,

    #[error("photographer not eligible for this code")]
    NotEligible,

    #[error("promo code fully redeemed")]
    GloballyExhausted,

    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),
}
