use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domains::ledger::{ConsumeOutcome, CorrelationKey, EntrySource, LedgerError, LedgerService};
use crate::services::storage_service::{ObjectHead, PresignedUpload, StorageService};

use super::models::{
    error_codes, IntentError, IntentStatus, SettleOutcome, UploadIntent, ALLOWED_CONTENT_TYPES,
    MAX_CONTENT_LENGTH, PRESIGN_TTL_SECS,
};

const INTENT_COLUMNS: &str = "id, photographer_id, event_id, object_key, content_type, \
     content_length, status, source, presign_expires_at, created_at, completed_at, \
     error_code, error_message, photo_id";

/// Grace period in minutes before a pending intent whose URL lapsed is
/// marked expired. Storage completion events can trail the actual PUT.
const EXPIRY_GRACE_MINUTES: i64 = 60;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    #[allow(dead_code)]
    id: Uuid,
    photographer_id: Uuid,
    expires_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

/// State machine for presigned direct-to-storage uploads. Settlement links a
/// finished upload to its ledger debit inside one transaction.
pub struct UploadIntentService {
    db: PgPool,
    storage: Arc<StorageService>,
    ledger: Arc<LedgerService>,
}

impl UploadIntentService {
    pub fn new(db: PgPool, storage: Arc<StorageService>, ledger: Arc<LedgerService>) -> Self {
        Self { db, storage, ledger }
    }

    // ========================================================================
    // PRESIGN
    // ========================================================================

    /// Mint a presigned PUT target and record the intent as `pending`. The
    /// balance check is advisory; the authoritative debit happens at
    /// settlement so an abandoned URL never commits credits.
    pub async fn create_presign(
        &self,
        photographer_id: Uuid,
        event_id: Uuid,
        content_type: &str,
        content_length: i64,
        source: Option<&str>,
    ) -> Result<(UploadIntent, PresignedUpload), IntentError> {
        validate_content(content_type, content_length)?;
        self.check_event(photographer_id, event_id).await?;

        let balance = self.ledger.balance(photographer_id).await?;
        if balance < 1 {
            return Err(IntentError::InsufficientCredits);
        }

        let intent_id = Uuid::new_v4();
        let object_key = build_object_key(event_id, intent_id, content_type);
        let presigned = self.storage.presign_put(
            &object_key,
            content_type,
            content_length,
            Duration::from_secs(PRESIGN_TTL_SECS),
        );

        let sql = format!(
            r#"
            INSERT INTO upload_intents (
                id, photographer_id, event_id, object_key, content_type,
                content_length, status, source, presign_expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
            RETURNING {INTENT_COLUMNS}
            "#
        );
        let intent: UploadIntent = sqlx::query_as(&sql)
            .bind(intent_id)
            .bind(photographer_id)
            .bind(event_id)
            .bind(&object_key)
            .bind(content_type)
            .bind(content_length)
            .bind(source)
            .bind(presigned.expires_at)
            .fetch_one(&self.db)
            .await?;

        info!(intent_id = %intent.id, event_id = %event_id, "upload intent created");
        Ok((intent, presigned))
    }

    /// Rotate an intent to a fresh object key and URL. The previous key
    /// becomes an orphan for the storage lifecycle policy to reap.
    pub async fn represign(
        &self,
        photographer_id: Uuid,
        intent_id: Uuid,
    ) -> Result<(UploadIntent, PresignedUpload), IntentError> {
        let mut tx = self.db.begin().await?;
        let intent = Self::lock_intent_by_id(&mut tx, intent_id).await?;
        let intent = intent.ok_or(IntentError::IntentNotFound)?;
        if intent.photographer_id != photographer_id {
            return Err(IntentError::NotOwner);
        }
        let status = IntentStatus::parse(&intent.status)
            .ok_or_else(|| IntentError::InvalidState(intent.status.clone()))?;
        if !status.can_represign() {
            return Err(IntentError::InvalidState(intent.status.clone()));
        }

        let object_key = build_object_key(intent.event_id, intent.id, &intent.content_type);
        let presigned = self.storage.presign_put(
            &object_key,
            &intent.content_type,
            intent.content_length,
            Duration::from_secs(PRESIGN_TTL_SECS),
        );

        let sql = format!(
            r#"
            UPDATE upload_intents
            SET object_key = $1,
                presign_expires_at = $2,
                status = 'pending',
                error_code = NULL,
                error_message = NULL
            WHERE id = $3
            RETURNING {INTENT_COLUMNS}
            "#
        );
        let updated: UploadIntent = sqlx::query_as(&sql)
            .bind(&object_key)
            .bind(presigned.expires_at)
            .bind(intent.id)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok((updated, presigned))
    }

    /// Explicit client abandonment.
    pub async fn cancel(
        &self,
        photographer_id: Uuid,
        intent_id: Uuid,
    ) -> Result<UploadIntent, IntentError> {
        let mut tx = self.db.begin().await?;
        let intent = Self::lock_intent_by_id(&mut tx, intent_id)
            .await?
            .ok_or(IntentError::IntentNotFound)?;
        if intent.photographer_id != photographer_id {
            return Err(IntentError::NotOwner);
        }
        let status = IntentStatus::parse(&intent.status)
            .ok_or_else(|| IntentError::InvalidState(intent.status.clone()))?;
        if !status.can_cancel() {
            return Err(IntentError::InvalidState(intent.status.clone()));
        }

        let sql = format!(
            "UPDATE upload_intents SET status = 'cancelled' WHERE id = $1 RETURNING {INTENT_COLUMNS}"
        );
        let updated: UploadIntent =
            sqlx::query_as(&sql).bind(intent.id).fetch_one(&mut *tx).await?;
        tx.commit().await?;
        Ok(updated)
    }

    // ========================================================================
    // SETTLEMENT
    // ========================================================================

    /// Close the loop on an object-storage completion event. At-least-once
    /// delivery is absorbed by the status guard plus the unique debit
    /// correlation; the status transition, photo row and debit commit
    /// atomically.
    pub async fn settle_upload(&self, object_key: &str) -> Result<SettleOutcome, IntentError> {
        let Some(intent) = self.find_by_object_key(object_key).await? else {
            return Ok(SettleOutcome::Ignored("stray object"));
        };
        match IntentStatus::parse(&intent.status) {
            Some(IntentStatus::Pending) | Some(IntentStatus::Uploaded) => {}
            _ => return Ok(SettleOutcome::Ignored("intent not pending")),
        }

        // Validate against the stored object before opening the transaction;
        // the HEAD is the only external call in the settle path.
        let head = self.storage.head_object(object_key).await?;
        let validation_failure = match &head {
            None => Some((error_codes::OBJECT_MISSING, "object not found in storage".to_string())),
            Some(h) => validate_head(&intent, h),
        };
        if let Some((code, message)) = validation_failure {
            let failed = self.mark_failed(intent.id, code, &message).await?;
            if head.is_some() {
                self.delete_object_best_effort(object_key).await;
            }
            return Ok(SettleOutcome::Failed(failed));
        }

        let mut tx = self.db.begin().await?;
        let locked = Self::lock_intent_by_id(&mut tx, intent.id)
            .await?
            .ok_or(IntentError::IntentNotFound)?;
        match IntentStatus::parse(&locked.status) {
            Some(IntentStatus::Pending) | Some(IntentStatus::Uploaded) => {}
            _ => {
                // Another worker won the race while we were validating.
                tx.rollback().await?;
                return Ok(SettleOutcome::Ignored("intent settled concurrently"));
            }
        }
        if locked.object_key != object_key {
            // A re-presign rotated the key while we were validating; this
            // event now refers to an orphaned object.
            tx.rollback().await?;
            return Ok(SettleOutcome::Ignored("object key rotated"));
        }

        sqlx::query("UPDATE upload_intents SET status = 'uploaded' WHERE id = $1")
            .bind(locked.id)
            .execute(&mut *tx)
            .await?;

        let photo_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO photos (id, photographer_id, event_id, object_key, content_type, content_length)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(photo_id)
        .bind(locked.photographer_id)
        .bind(locked.event_id)
        .bind(&locked.object_key)
        .bind(&locked.content_type)
        .bind(locked.content_length)
        .execute(&mut *tx)
        .await?;

        let consume = LedgerService::consume_in_tx(
            &mut tx,
            locked.photographer_id,
            1,
            EntrySource::Upload,
            CorrelationKey::UploadIntent(locked.id),
        )
        .await;

        match consume {
            Ok(ConsumeOutcome::Consumed(_)) | Ok(ConsumeOutcome::AlreadyConsumed(_)) => {
                let sql = format!(
                    r#"
                    UPDATE upload_intents
                    SET status = 'completed', photo_id = $1, completed_at = NOW()
                    WHERE id = $2
                    RETURNING {INTENT_COLUMNS}
                    "#
                );
                let completed: UploadIntent =
                    sqlx::query_as(&sql).bind(photo_id).bind(locked.id).fetch_one(&mut *tx).await?;
                tx.commit().await?;
                info!(intent_id = %completed.id, "upload settled");
                Ok(SettleOutcome::Completed(completed))
            }
            Err(LedgerError::InsufficientFunds { available, requested }) => {
                tx.rollback().await?;
                warn!(
                    intent_id = %locked.id,
                    available,
                    requested,
                    "settlement rejected, balance exhausted"
                );
                let failed = self
                    .mark_failed(
                        locked.id,
                        error_codes::INSUFFICIENT_CREDITS,
                        "balance exhausted before settlement",
                    )
                    .await?;
                self.delete_object_best_effort(object_key).await;
                Ok(SettleOutcome::Failed(failed))
            }
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub async fn list_intents(
        &self,
        photographer_id: Uuid,
        event_id: Uuid,
        cursor: Option<&str>,
        limit: i64,
    ) -> Result<(Vec<UploadIntent>, Option<String>), IntentError> {
        self.check_event_owner(photographer_id, event_id).await?;

        let limit = limit.clamp(1, 100);
        let cursor = cursor.map(decode_cursor).transpose()?;

        let sql = format!(
            r#"
            SELECT {INTENT_COLUMNS}
            FROM upload_intents
            WHERE event_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#
        );
        let (cursor_at, cursor_id) = match cursor {
            Some((at, id)) => (Some(at), id),
            None => (None, Uuid::nil()),
        };
        let intents: Vec<UploadIntent> = sqlx::query_as(&sql)
            .bind(event_id)
            .bind(cursor_at)
            .bind(cursor_id)
            .bind(limit)
            .fetch_all(&self.db)
            .await?;

        let next_cursor = if intents.len() as i64 == limit {
            intents.last().map(|i| encode_cursor(i.created_at, i.id))
        } else {
            None
        };
        Ok((intents, next_cursor))
    }

    /// Batch snapshot for client polling. Rows not owned by the requester
    /// are silently omitted.
    pub async fn status_batch(
        &self,
        photographer_id: Uuid,
        ids: &[Uuid],
    ) -> Result<Vec<UploadIntent>, IntentError> {
        let sql = format!(
            r#"
            SELECT {INTENT_COLUMNS}
            FROM upload_intents
            WHERE photographer_id = $1 AND id = ANY($2)
            "#
        );
        let intents = sqlx::query_as(&sql)
            .bind(photographer_id)
            .bind(ids)
            .fetch_all(&self.db)
            .await?;
        Ok(intents)
    }

    /// Scheduler hook: mark pending intents whose URL lapsed, past a grace
    /// window for trailing storage events.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<u64, IntentError> {
        let result = sqlx::query(
            r#"
            UPDATE upload_intents
            SET status = 'expired'
            WHERE status = 'pending'
              AND presign_expires_at < $1
            "#,
        )
        .bind(now - chrono::Duration::minutes(EXPIRY_GRACE_MINUTES))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn find_by_object_key(&self, object_key: &str) -> Result<Option<UploadIntent>, IntentError> {
        let sql = format!("SELECT {INTENT_COLUMNS} FROM upload_intents WHERE object_key = $1");
        Ok(sqlx::query_as(&sql).bind(object_key).fetch_optional(&self.db).await?)
    }

    async fn lock_intent_by_id(
        tx: &mut Transaction<'_, Postgres>,
        intent_id: Uuid,
    ) -> Result<Option<UploadIntent>, IntentError> {
        let sql =
            format!("SELECT {INTENT_COLUMNS} FROM upload_intents WHERE id = $1 FOR UPDATE");
        Ok(sqlx::query_as(&sql).bind(intent_id).fetch_optional(&mut **tx).await?)
    }

    async fn mark_failed(
        &self,
        intent_id: Uuid,
        code: &str,
        message: &str,
    ) -> Result<UploadIntent, IntentError> {
        let sql = format!(
            r#"
            UPDATE upload_intents
            SET status = 'failed', error_code = $1, error_message = $2
            WHERE id = $3
            RETURNING {INTENT_COLUMNS}
            "#
        );
        Ok(sqlx::query_as(&sql)
            .bind(code)
            .bind(message)
            .bind(intent_id)
            .fetch_one(&self.db)
            .await?)
    }

    async fn delete_object_best_effort(&self, object_key: &str) {
        if let Err(e) = self.storage.delete_object(object_key).await {
            // Lifecycle rules will catch anything we miss here.
            warn!(object_key, error = %e, "failed to delete rejected upload object");
        }
    }

    async fn check_event(&self, photographer_id: Uuid, event_id: Uuid) -> Result<(), IntentError> {
        let event = self.load_event(event_id).await?;
        if event.photographer_id != photographer_id {
            return Err(IntentError::NotOwner);
        }
        if event.expires_at <= Utc::now() {
            return Err(IntentError::EventExpired);
        }
        Ok(())
    }

    async fn check_event_owner(
        &self,
        photographer_id: Uuid,
        event_id: Uuid,
    ) -> Result<(), IntentError> {
        let event = self.load_event(event_id).await?;
        if event.photographer_id != photographer_id {
            return Err(IntentError::NotOwner);
        }
        Ok(())
    }

    async fn load_event(&self, event_id: Uuid) -> Result<EventRow, IntentError> {
        let event: Option<EventRow> = sqlx::query_as(
            "SELECT id, photographer_id, expires_at, deleted_at FROM events WHERE id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.db)
        .await?;
        match event {
            Some(e) if e.deleted_at.is_none() => Ok(e),
            _ => Err(IntentError::EventNotFound),
        }
    }
}

fn validate_content(content_type: &str, content_length: i64) -> Result<(), IntentError> {
    if !ALLOWED_CONTENT_TYPES.contains(&content_type) {
        return Err(IntentError::UnsupportedContentType(content_type.to_string()));
    }
    if content_length <= 0 {
        return Err(IntentError::EmptyContent);
    }
    if content_length > MAX_CONTENT_LENGTH {
        return Err(IntentError::ContentTooLarge(content_length));
    }
    Ok(())
}

fn validate_head(intent: &UploadIntent, head: &ObjectHead) -> Option<(&'static str, String)> {
    if head.content_length != intent.content_length {
        return Some((
            error_codes::SIZE_MISMATCH,
            format!("expected {} bytes, stored {}", intent.content_length, head.content_length),
        ));
    }
    if let Some(stored_type) = &head.content_type {
        // Compare the media type alone; parameters like charset are noise.
        let stored = stored_type.split(';').next().unwrap_or("").trim();
        if !stored.eq_ignore_ascii_case(&intent.content_type) {
            return Some((
                error_codes::TYPE_MISMATCH,
                format!("expected {}, stored {}", intent.content_type, stored),
            ));
        }
    }
    None
}

fn build_object_key(event_id: Uuid, intent_id: Uuid, content_type: &str) -> String {
    let suffix: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
    let ext = match content_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => "bin",
    };
    format!("events/{}/incoming/{}-{}.{}", event_id, intent_id, suffix.to_lowercase(), ext)
}

fn encode_cursor(created_at: DateTime<Utc>, id: Uuid) -> String {
    format!("{}:{}", created_at.timestamp_micros(), id)
}

fn decode_cursor(cursor: &str) -> Result<(DateTime<Utc>, Uuid), IntentError> {
    let (micros, id) = cursor.split_once(':').ok_or(IntentError::InvalidCursor)?;
    let micros: i64 = micros.parse().map_err(|_| IntentError::InvalidCursor)?;
    let at =
        DateTime::<Utc>::from_timestamp_micros(micros).ok_or(IntentError::InvalidCursor)?;
    let id = Uuid::parse_str(id).map_err(|_| IntentError::InvalidCursor)?;
    Ok((at, id))
}
