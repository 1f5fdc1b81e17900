use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

// ======================================================================
// LEDGER ENTRIES
// ======================================================================

/// Immutable journal row. Positive amounts are grants, negative amounts are
/// consumption. Exactly one correlation column is set per row and each
/// correlation column is UNIQUE, which is what makes replays converge.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub photographer_id: Uuid,
    pub amount: i64,
    pub entry_type: String,
    pub source: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
    pub promo_code: Option<String>,
    pub stripe_session_id: Option<String>,
    pub apple_transaction_id: Option<String>,
    pub admin_op_id: Option<String>,
    pub upload_intent_id: Option<Uuid>,
    pub gift_redemption_id: Option<Uuid>,
    pub expired_grant_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Credit,
    Debit,
    Purchase,
    Gift,
    Refund,
    ExpiryAdjust,
    AdminAdjust,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Credit => "credit",
            EntryType::Debit => "debit",
            EntryType::Purchase => "purchase",
            EntryType::Gift => "gift",
            EntryType::Refund => "refund",
            EntryType::ExpiryAdjust => "expiry_adjust",
            EntryType::AdminAdjust => "admin_adjust",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrySource {
    Purchase,
    Gift,
    Discount,
    Refund,
    AdminAdjustment,
    ApplePurchase,
    Upload,
}

impl EntrySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntrySource::Purchase => "purchase",
            EntrySource::Gift => "gift",
            EntrySource::Discount => "discount",
            EntrySource::Refund => "refund",
            EntrySource::AdminAdjustment => "admin_adjustment",
            EntrySource::ApplePurchase => "apple_purchase",
            EntrySource::Upload => "upload",
        }
    }
}

/// External reference that deduplicates a ledger write. One variant per
/// correlation column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrelationKey {
    StripeSession(String),
    AppleTransaction(String),
    AdminOp(String),
    UploadIntent(Uuid),
    GiftRedemption(Uuid),
    ExpiredGrant(Uuid),
}

impl CorrelationKey {
    pub fn column(&self) -> &'static str {
        match self {
            CorrelationKey::StripeSession(_) => "stripe_session_id",
            CorrelationKey::AppleTransaction(_) => "apple_transaction_id",
            CorrelationKey::AdminOp(_) => "admin_op_id",
            CorrelationKey::UploadIntent(_) => "upload_intent_id",
            CorrelationKey::GiftRedemption(_) => "gift_redemption_id",
            CorrelationKey::ExpiredGrant(_) => "expired_grant_id",
        }
    }

    pub fn text_value(&self) -> Option<&str> {
        match self {
            CorrelationKey::StripeSession(s)
            | CorrelationKey::AppleTransaction(s)
            | CorrelationKey::AdminOp(s) => Some(s),
            _ => None,
        }
    }

    pub fn uuid_value(&self) -> Option<Uuid> {
        match self {
            CorrelationKey::UploadIntent(u)
            | CorrelationKey::GiftRedemption(u)
            | CorrelationKey::ExpiredGrant(u) => Some(*u),
            _ => None,
        }
    }
}

// ======================================================================
// OUTCOMES & ERRORS
// ======================================================================

/// Result of a grant. A replayed correlation returns the pre-existing row.
#[derive(Debug, Clone)]
pub enum GrantOutcome {
    Granted(LedgerEntry),
    AlreadyGranted(LedgerEntry),
}

impl GrantOutcome {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            GrantOutcome::Granted(e) | GrantOutcome::AlreadyGranted(e) => e,
        }
    }
}

/// Result of a consume. A replayed correlation returns the pre-existing
/// debit without touching the balance again.
#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    Consumed(LedgerEntry),
    AlreadyConsumed(LedgerEntry),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient funds: {available} available, {requested} requested")]
    InsufficientFunds { available: i64, requested: i64 },

    #[error("invalid ledger amount: {0}")]
    InvalidAmount(i64),

    #[error("no grant found for refund correlation {0}")]
    NoMatchingGrant(String),

    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),
}

/// Spendable balance plus the soonest upcoming grant expiry.
#[derive(Debug, Clone, Serialize)]
pub struct BalanceDetail {
    pub balance: i64,
    pub nearest_expiry: Option<DateTime<Utc>>,
}
