use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domains::uploads::SettleOutcome;
use crate::observability::metrics::{record_queue_retry, record_settlement, SETTLEMENT_DURATION};
use crate::services::queue::{
    self, QueueJob, KIND_HARD_DELETE_EVENT, KIND_SETTLE_UPLOAD, KIND_SOFT_DELETE_EVENT,
};
use crate::services::storage_service::StorageError;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const THROTTLE_PAUSE: Duration = Duration::from_secs(30);
const BATCH_SIZE: i64 = 10;

enum JobResult {
    Done,
    Retry(String),
    Throttled(String),
    Permanent(String),
}

/// Queue consumer for settlement and retention work. Polls forever; every
/// job is safe to re-run because the mutations behind it are guarded by
/// unique correlations or status checks.
pub async fn start_queue_worker(state: Arc<AppState>) {
    info!("queue worker started (poll every {:?})", POLL_INTERVAL);
    loop {
        let jobs = match queue::claim_batch(&state.db_pool, BATCH_SIZE).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("queue claim failed: {}", e);
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        if jobs.is_empty() {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }

        let mut throttled = false;
        for job in jobs {
            let result = process_job(&state, &job).await;
            let finish = match result {
                JobResult::Done => queue::complete(&state.db_pool, job.id).await,
                JobResult::Retry(reason) => {
                    record_queue_retry(&job.kind);
                    warn!(job_id = job.id, kind = %job.kind, attempts = job.attempts, "job retry: {}", reason);
                    queue::retry_later(&state.db_pool, &job, &reason).await
                }
                JobResult::Throttled(reason) => {
                    throttled = true;
                    record_queue_retry(&job.kind);
                    warn!(job_id = job.id, kind = %job.kind, "downstream throttle: {}", reason);
                    queue::retry_later(&state.db_pool, &job, &reason).await
                }
                JobResult::Permanent(reason) => {
                    error!(job_id = job.id, kind = %job.kind, "job failed permanently: {}", reason);
                    queue::fail(&state.db_pool, job.id, &reason).await
                }
            };
            if let Err(e) = finish {
                error!(job_id = job.id, "queue bookkeeping failed: {}", e);
            }
        }

        if throttled {
            tokio::time::sleep(THROTTLE_PAUSE).await;
        }
    }
}

async fn process_job(state: &Arc<AppState>, job: &QueueJob) -> JobResult {
    match job.kind.as_str() {
        KIND_SETTLE_UPLOAD => settle_upload(state, &job.payload).await,
        KIND_SOFT_DELETE_EVENT => soft_delete_event(state, &job.payload).await,
        KIND_HARD_DELETE_EVENT => hard_delete_event(state, &job.payload).await,
        other => JobResult::Permanent(format!("unknown job kind '{}'", other)),
    }
}

async fn settle_upload(state: &Arc<AppState>, payload: &Value) -> JobResult {
    let Some(object_key) = payload.get("object_key").and_then(|v| v.as_str()) else {
        return JobResult::Permanent("settle_upload payload missing object_key".to_string());
    };

    let timer = SETTLEMENT_DURATION.start_timer();
    let result = state.intents.settle_upload(object_key).await;
    timer.observe_duration();

    match result {
        Ok(SettleOutcome::Completed(intent)) => {
            record_settlement("completed");
            info!(intent_id = %intent.id, object_key, "settlement completed");
            JobResult::Done
        }
        Ok(SettleOutcome::Failed(intent)) => {
            record_settlement("failed");
            info!(
                intent_id = %intent.id,
                error_code = intent.error_code.as_deref().unwrap_or(""),
                "settlement terminally failed"
            );
            JobResult::Done
        }
        Ok(SettleOutcome::Ignored(reason)) => {
            record_settlement("ignored");
            info!(object_key, reason, "settlement event ignored");
            JobResult::Done
        }
        Err(e) if is_throttle(&e) => JobResult::Throttled(e.to_string()),
        Err(e) if e.is_transient() => JobResult::Retry(e.to_string()),
        Err(e) => JobResult::Permanent(e.to_string()),
    }
}

fn is_throttle(err: &crate::domains::uploads::IntentError) -> bool {
    matches!(
        err,
        crate::domains::uploads::IntentError::Storage(StorageError::UnexpectedStatus(429))
    )
}

async fn soft_delete_event(state: &Arc<AppState>, payload: &Value) -> JobResult {
    let Some(event_id) = parse_event_id(payload) else {
        return JobResult::Permanent("soft_delete_event payload missing event_id".to_string());
    };

    let result = sqlx::query(
        "UPDATE events SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
    )
    .bind(event_id)
    .execute(&state.db_pool)
    .await;

    match result {
        Ok(r) => {
            if r.rows_affected() > 0 {
                info!(event_id = %event_id, "event soft-deleted");
            }
            JobResult::Done
        }
        Err(e) if crate::error::is_transient(&e) => JobResult::Retry(e.to_string()),
        Err(e) => JobResult::Permanent(e.to_string()),
    }
}

/// Hard deletion owns the multi-step teardown: object removal first, then
/// database marking. Re-runs skip already-deleted objects (404 is success).
async fn hard_delete_event(state: &Arc<AppState>, payload: &Value) -> JobResult {
    let Some(event_id) = parse_event_id(payload) else {
        return JobResult::Permanent("hard_delete_event payload missing event_id".to_string());
    };

    let keys: Result<Vec<(String,)>, sqlx::Error> =
        sqlx::query_as("SELECT object_key FROM photos WHERE event_id = $1")
            .bind(event_id)
            .fetch_all(&state.db_pool)
            .await;
    let keys = match keys {
        Ok(keys) => keys,
        Err(e) if crate::error::is_transient(&e) => return JobResult::Retry(e.to_string()),
        Err(e) => return JobResult::Permanent(e.to_string()),
    };

    for (key,) in &keys {
        match state.storage.delete_object(key).await {
            Ok(()) => {}
            Err(StorageError::UnexpectedStatus(429)) => {
                return JobResult::Throttled("object store throttled deletes".to_string())
            }
            Err(e) if e.is_transient() => return JobResult::Retry(e.to_string()),
            Err(e) => return JobResult::Permanent(e.to_string()),
        }
    }

    let mark = async {
        let mut tx = state.db_pool.begin().await?;
        sqlx::query("DELETE FROM photos WHERE event_id = $1")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE events SET purged_at = NOW() WHERE id = $1 AND purged_at IS NULL")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok::<_, sqlx::Error>(())
    };

    match mark.await {
        Ok(()) => {
            info!(event_id = %event_id, photos = keys.len(), "event hard-deleted");
            JobResult::Done
        }
        Err(e) if crate::error::is_transient(&e) => JobResult::Retry(e.to_string()),
        Err(e) => JobResult::Permanent(e.to_string()),
    }
}

fn parse_event_id(payload: &Value) -> Option<Uuid> {
    payload.get("event_id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok())
}
