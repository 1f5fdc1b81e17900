use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

// ============================================================================
// JOB QUEUE - Postgres-backed, at-least-once
// ============================================================================

pub const KIND_SETTLE_UPLOAD: &str = "settle_upload";
pub const KIND_SOFT_DELETE_EVENT: &str = "soft_delete_event";
pub const KIND_HARD_DELETE_EVENT: &str = "hard_delete_event";

/// Attempts before a job is parked as permanently failed.
pub const MAX_ATTEMPTS: i32 = 10;

/// Claimed jobs become invisible for this long; a crashed worker's jobs
/// resurface once it lapses.
const VISIBILITY_SECS: i64 = 120;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueJob {
    pub id: i64,
    pub kind: String,
    pub dedup_key: String,
    pub payload: Value,
    pub attempts: i32,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),
}

/// Enqueue a job, deduplicated on (kind, dedup_key). Returns false when an
/// equivalent job already exists — redelivered bus events land here.
pub async fn enqueue(
    pool: &PgPool,
    kind: &str,
    dedup_key: &str,
    payload: Value,
) -> Result<bool, QueueError> {
    let result = sqlx::query(
        r#"
        INSERT INTO queue_jobs (kind, dedup_key, payload)
        VALUES ($1, $2, $3)
        ON CONFLICT (kind, dedup_key) DO NOTHING
        "#,
    )
    .bind(kind)
    .bind(dedup_key)
    .bind(payload)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Same as [`enqueue`] inside a caller-owned transaction.
pub async fn enqueue_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    kind: &str,
    dedup_key: &str,
    payload: Value,
) -> Result<bool, QueueError> {
    let result = sqlx::query(
        r#"
        INSERT INTO queue_jobs (kind, dedup_key, payload)
        VALUES ($1, $2, $3)
        ON CONFLICT (kind, dedup_key) DO NOTHING
        "#,
    )
    .bind(kind)
    .bind(dedup_key)
    .bind(payload)
    .execute(&mut **tx)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claim up to `limit` ready jobs. `FOR UPDATE SKIP LOCKED` keeps parallel
/// workers from fighting over rows; the visibility bump makes the claim
/// survive a worker crash as a delayed retry.
pub async fn claim_batch(pool: &PgPool, limit: i64) -> Result<Vec<QueueJob>, QueueError> {
    let jobs: Vec<QueueJob> = sqlx::query_as(
        r#"
        UPDATE queue_jobs
        SET attempts = attempts + 1,
            run_after = NOW() + make_interval(secs => $2)
        WHERE id IN (
            SELECT id FROM queue_jobs
            WHERE status = 'pending' AND run_after <= NOW()
            ORDER BY id
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        RETURNING id, kind, dedup_key, payload, attempts, run_after, created_at
        "#,
    )
    .bind(limit)
    .bind(VISIBILITY_SECS as f64)
    .fetch_all(pool)
    .await?;
    Ok(jobs)
}

/// The job finished; drop it.
pub async fn complete(pool: &PgPool, job_id: i64) -> Result<(), QueueError> {
    sqlx::query("DELETE FROM queue_jobs WHERE id = $1").bind(job_id).execute(pool).await?;
    Ok(())
}

/// Transient failure: push the job out by an exponential backoff, or park
/// it permanently once the attempt budget is spent.
pub async fn retry_later(pool: &PgPool, job: &QueueJob, error: &str) -> Result<(), QueueError> {
    if job.attempts >= MAX_ATTEMPTS {
        return fail(pool, job.id, error).await;
    }
    let delay = backoff_secs(job.attempts);
    sqlx::query(
        r#"
        UPDATE queue_jobs
        SET run_after = NOW() + make_interval(secs => $1),
            last_error = $2
        WHERE id = $3
        "#,
    )
    .bind(delay as f64)
    .bind(error)
    .bind(job.id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Permanent failure: keep the row for operator inspection, out of the
/// pending scan.
pub async fn fail(pool: &PgPool, job_id: i64, error: &str) -> Result<(), QueueError> {
    sqlx::query("UPDATE queue_jobs SET status = 'failed', last_error = $1 WHERE id = $2")
        .bind(error)
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff with jitter, capped at an hour.
pub fn backoff_secs(attempts: i32) -> u64 {
    let base = 30u64.saturating_mul(2u64.saturating_pow(attempts.max(0) as u32));
    let capped = base.min(3600);
    capped + rand::thread_rng().gen_range(0..10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let early = backoff_secs(0);
        assert!((30..40).contains(&early));
        let later = backoff_secs(3);
        assert!((240..250).contains(&later));
        let capped = backoff_secs(20);
        assert!((3600..3610).contains(&capped));
    }
}
