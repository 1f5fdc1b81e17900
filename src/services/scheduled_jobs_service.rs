// ============================================================================
// SCHEDULED JOBS SERVICE - time-driven producers
// ============================================================================
//
// Producers only: each job selects work and pushes it onto the queue (or
// runs a single bounded statement). The heavy multi-step deletion lives in
// the queue consumer where per-message budgets apply.

use anyhow::Result;
use serde_json::json;
use sqlx::PgPool;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

use crate::services::queue::{self, KIND_HARD_DELETE_EVENT, KIND_SOFT_DELETE_EVENT};
use crate::state::AppState;

pub struct ScheduledJobsService {
    scheduler: JobScheduler,
    state: Arc<AppState>,
}

impl ScheduledJobsService {
    pub async fn new(state: Arc<AppState>) -> Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self { scheduler, state })
    }

    pub async fn start(&self) -> Result<()> {
        info!("Starting scheduled jobs...");

        // Job 1: expiry sweep over the credit ledger (daily at 2:30 AM)
        self.add_expiry_sweep_job().await?;

        // Job 2: mark stale pending upload intents (hourly)
        self.add_expire_intents_job().await?;

        // Job 3: enqueue soft-deletes for expired events (daily at 3 AM)
        self.add_soft_delete_producer_job().await?;

        // Job 4: enqueue hard-deletes past the retention window (daily at 4 AM)
        self.add_hard_delete_producer_job().await?;

        self.scheduler.start().await?;

        info!("All scheduled jobs started successfully");
        Ok(())
    }

    async fn add_expiry_sweep_job(&self) -> Result<()> {
        let state = self.state.clone();

        let job = Job::new_async("0 30 2 * * *", move |_uuid, _l| {
            let state = state.clone();
            Box::pin(async move {
                info!("Running ledger expiry sweep...");
                match state.ledger.expiry_sweep(chrono::Utc::now()).await {
                    Ok(count) => info!("Expiry sweep wrote {} adjustments", count),
                    Err(e) => error!("Error running expiry sweep: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Added expiry_sweep job (daily at 2:30 AM)");
        Ok(())
    }

    async fn add_expire_intents_job(&self) -> Result<()> {
        let state = self.state.clone();

        let job = Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let state = state.clone();
            Box::pin(async move {
                match state.intents.expire_stale(chrono::Utc::now()).await {
                    Ok(count) if count > 0 => info!("Expired {} stale upload intents", count),
                    Ok(_) => {}
                    Err(e) => error!("Error expiring upload intents: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Added expire_intents job (hourly)");
        Ok(())
    }

    async fn add_soft_delete_producer_job(&self) -> Result<()> {
        let state = self.state.clone();

        let job = Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let state = state.clone();
            Box::pin(async move {
                info!("Running soft-delete producer...");
                let batch = state.config.retention.cleanup_batch_size;
                match enqueue_soft_deletes(&state.db_pool, batch).await {
                    Ok(count) => info!("Enqueued {} soft-delete jobs", count),
                    Err(e) => error!("Error enqueuing soft-deletes: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Added soft_delete producer job (daily at 3 AM)");
        Ok(())
    }

    async fn add_hard_delete_producer_job(&self) -> Result<()> {
        let state = self.state.clone();

        let job = Job::new_async("0 0 4 * * *", move |_uuid, _l| {
            let state = state.clone();
            Box::pin(async move {
                info!("Running hard-delete producer...");
                let batch = state.config.retention.cleanup_batch_size;
                let retention_days = state.config.retention.retention_days;
                match enqueue_hard_deletes(&state.db_pool, retention_days, batch).await {
                    Ok(count) => info!("Enqueued {} hard-delete jobs", count),
                    Err(e) => error!("Error enqueuing hard-deletes: {}", e),
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Added hard_delete producer job (daily at 4 AM)");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down scheduled jobs...");
        self.scheduler.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// PRODUCER IMPLEMENTATIONS
// ============================================================================

/// One soft-delete job per expired, still-live event, up to the batch cap.
async fn enqueue_soft_deletes(db: &PgPool, batch: i64) -> Result<u64> {
    let expired: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM events
        WHERE expires_at < NOW()
          AND deleted_at IS NULL
        ORDER BY expires_at ASC
        LIMIT $1
        "#,
    )
    .bind(batch)
    .fetch_all(db)
    .await?;

    let mut enqueued = 0u64;
    for (event_id,) in expired {
        let fresh = queue::enqueue(
            db,
            KIND_SOFT_DELETE_EVENT,
            &event_id.to_string(),
            json!({ "event_id": event_id }),
        )
        .await?;
        if fresh {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

/// One hard-delete job per soft-deleted event older than the retention
/// window, up to the batch cap.
async fn enqueue_hard_deletes(db: &PgPool, retention_days: i64, batch: i64) -> Result<u64> {
    let due: Vec<(Uuid,)> = sqlx::query_as(
        r#"
        SELECT id FROM events
        WHERE deleted_at IS NOT NULL
          AND deleted_at < NOW() - make_interval(days => $1)
          AND purged_at IS NULL
        ORDER BY deleted_at ASC
        LIMIT $2
        "#,
    )
    .bind(retention_days as i32)
    .bind(batch)
    .fetch_all(db)
    .await?;

    let mut enqueued = 0u64;
    for (event_id,) in due {
        let fresh = queue::enqueue(
            db,
            KIND_HARD_DELETE_EVENT,
            &event_id.to_string(),
            json!({ "event_id": event_id }),
        )
        .await?;
        if fresh {
            enqueued += 1;
        }
    }
    Ok(enqueued)
}

// ============================================================================
// SHARED INSTANCE
// ============================================================================

use std::sync::OnceLock;

static SCHEDULED_JOBS: OnceLock<Arc<ScheduledJobsService>> = OnceLock::new();

pub async fn init_scheduled_jobs(state: Arc<AppState>) -> Result<()> {
    let service = Arc::new(ScheduledJobsService::new(state).await?);
    service.start().await?;

    if SCHEDULED_JOBS.set(service).is_err() {
        error!("Scheduled jobs already initialized");
    }

    Ok(())
}

pub fn get_scheduled_jobs() -> Option<Arc<ScheduledJobsService>> {
    SCHEDULED_JOBS.get().cloned()
}
