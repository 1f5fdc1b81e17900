use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use crate::domains::ledger::LedgerError;
use crate::services::storage_service::StorageError;

// ======================================================================
// UPLOAD INTENTS
// ======================================================================

pub const ALLOWED_CONTENT_TYPES: &[&str] =
    &["image/jpeg", "image/png", "image/webp", "image/heic"];

/// Hard cap on a single upload.
pub const MAX_CONTENT_LENGTH: i64 = 50 * 1024 * 1024;

/// How long a minted PUT URL stays valid.
pub const PRESIGN_TTL_SECS: u64 = 15 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UploadIntent {
    pub id: Uuid,
    pub photographer_id: Uuid,
    pub event_id: Uuid,
    pub object_key: String,
    pub content_type: String,
    pub content_length: i64,
    pub status: String,
    pub source: Option<String>,
    pub presign_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub photo_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentStatus {
    Pending,
    Uploaded,
    Completed,
    Expired,
    Failed,
    Cancelled,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Uploaded => "uploaded",
            IntentStatus::Completed => "completed",
            IntentStatus::Expired => "expired",
            IntentStatus::Failed => "failed",
            IntentStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IntentStatus::Pending),
            "uploaded" => Some(IntentStatus::Uploaded),
            "completed" => Some(IntentStatus::Completed),
            "expired" => Some(IntentStatus::Expired),
            "failed" => Some(IntentStatus::Failed),
            "cancelled" => Some(IntentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Completed | IntentStatus::Failed | IntentStatus::Cancelled)
    }

    /// States from which a client may mint a fresh URL for the same intent.
    pub fn can_represign(&self) -> bool {
        matches!(self, IntentStatus::Pending | IntentStatus::Expired | IntentStatus::Failed)
    }

    pub fn can_cancel(&self) -> bool {
        matches!(self, IntentStatus::Pending | IntentStatus::Expired | IntentStatus::Failed)
    }
}

/// Terminal-failure diagnostics written onto the intent row.
pub mod error_codes {
    pub const INSUFFICIENT_CREDITS: &str = "insufficient_credits";
    pub const SIZE_MISMATCH: &str = "size_mismatch";
    pub const TYPE_MISMATCH: &str = "type_mismatch";
    pub const OBJECT_MISSING: &str = "object_missing";
}

/// Outcome of one settlement attempt.
#[derive(Debug)]
pub enum SettleOutcome {
    /// Debit written, photo materialized.
    Completed(UploadIntent),
    /// Terminal failure recorded on the intent (insufficient credits,
    /// validation mismatch); the uploaded object has been removed.
    Failed(UploadIntent),
    /// Nothing to do: stray object, replayed event, or a terminal intent.
    Ignored(&'static str),
}

#[derive(Debug, Error)]
pub enum IntentError {
    #[error("event not found")]
    EventNotFound,

    #[error("intent not found")]
    IntentNotFound,

    #[error("event does not belong to the requester")]
    NotOwner,

    #[error("event expired")]
    EventExpired,

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("content length {0} exceeds the allowed maximum")]
    ContentTooLarge(i64),

    #[error("content length must be positive")]
    EmptyContent,

    #[error("insufficient credits")]
    InsufficientCredits,

    #[error("intent is {0}, operation not permitted")]
    InvalidState(String),

    #[error("pagination cursor unparsable")]
    InvalidCursor,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntentError {
    /// Whether a settlement attempt hitting this error should be redelivered.
    pub fn is_transient(&self) -> bool {
        match self {
            IntentError::Database(e) => crate::error::is_transient(e),
            IntentError::Storage(e) => e.is_transient(),
            IntentError::Ledger(LedgerError::Database(e)) => crate::error::is_transient(e),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(IntentStatus::Completed.is_terminal());
        assert!(IntentStatus::Failed.is_terminal());
        assert!(IntentStatus::Cancelled.is_terminal());
        assert!(!IntentStatus::Pending.is_terminal());
        assert!(!IntentStatus::Uploaded.is_terminal());
        assert!(!IntentStatus::Expired.is_terminal());
    }

    #[test]
    fn test_represign_allowed_states() {
        assert!(IntentStatus::Pending.can_represign());
        assert!(IntentStatus::Expired.can_represign());
        assert!(IntentStatus::Failed.can_represign());
        assert!(!IntentStatus::Uploaded.can_represign());
        assert!(!IntentStatus::Completed.can_represign());
        assert!(!IntentStatus::Cancelled.can_represign());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            IntentStatus::Pending,
            IntentStatus::Uploaded,
            IntentStatus::Completed,
            IntentStatus::Expired,
            IntentStatus::Failed,
            IntentStatus::Cancelled,
        ] {
            assert_eq!(IntentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(IntentStatus::parse("bogus"), None);
    }
}
