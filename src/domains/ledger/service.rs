use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::observability::metrics::record_ledger_entry;

use super::models::{
    BalanceDetail, ConsumeOutcome, CorrelationKey, EntrySource, EntryType, GrantOutcome,
    LedgerEntry, LedgerError,
};

const ENTRY_COLUMNS: &str = "id, photographer_id, amount, entry_type, source, expires_at, \
     issued_at, promo_code, stripe_session_id, apple_transaction_id, admin_op_id, \
     upload_intent_id, gift_redemption_id, expired_grant_id";

/// Append-only credit journal. Every write happens inside a transaction and
/// is keyed by a unique external correlation, so replays and concurrent
/// duplicates converge to a single row.
pub struct LedgerService {
    db: PgPool,
}

impl LedgerService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    // ========================================================================
    // GRANT
    // ========================================================================

    /// Record a credit grant (or a negative adjustment such as a refund).
    /// Returns the pre-existing entry when the correlation was already used.
    pub async fn grant(
        &self,
        photographer_id: Uuid,
        amount: i64,
        entry_type: EntryType,
        source: EntrySource,
        correlation: CorrelationKey,
        expires_at: Option<DateTime<Utc>>,
        promo_code: Option<&str>,
    ) -> Result<GrantOutcome, LedgerError> {
        let mut tx = self.db.begin().await?;
        let outcome = Self::grant_in_tx(
            &mut tx,
            photographer_id,
            amount,
            entry_type,
            source,
            correlation,
            expires_at,
            promo_code,
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Grant inside a caller-owned transaction. Used by webhook handlers
    /// that need the grant and related rows (promo usage, session status)
    /// to commit atomically.
    #[allow(clippy::too_many_arguments)]
    pub async fn grant_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        photographer_id: Uuid,
        amount: i64,
        entry_type: EntryType,
        source: EntrySource,
        correlation: CorrelationKey,
        expires_at: Option<DateTime<Utc>>,
        promo_code: Option<&str>,
    ) -> Result<GrantOutcome, LedgerError> {
        if amount == 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        if let Some(existing) = Self::find_by_correlation_tx(tx, &correlation).await? {
            return Ok(GrantOutcome::AlreadyGranted(existing));
        }

        let inserted = Self::insert_entry(
            tx,
            photographer_id,
            amount,
            entry_type,
            source,
            &correlation,
            expires_at,
            promo_code,
        )
        .await?;

        match inserted {
            Some(entry) => {
                Self::apply_balance_cache(tx, photographer_id, amount).await?;
                record_ledger_entry(entry_type.as_str());
                info!(
                    photographer_id = %photographer_id,
                    amount,
                    source = source.as_str(),
                    "ledger grant recorded"
                );
                Ok(GrantOutcome::Granted(entry))
            }
            None => {
                // A concurrent writer won the unique constraint; its row is
                // visible now that the conflict resolved.
                let existing = Self::find_by_correlation_tx(tx, &correlation)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                warn!(
                    photographer_id = %photographer_id,
                    correlation = correlation.column(),
                    "grant lost correlation race, returning existing entry"
                );
                Ok(GrantOutcome::AlreadyGranted(existing))
            }
        }
    }

    // ========================================================================
    // CONSUME
    // ========================================================================

    /// Debit credits against the running balance. Locks the photographer's
    /// open grants (FIFO by expiry) so concurrent consumers for the same
    /// photographer serialize; across photographers nothing blocks.
    pub async fn consume(
        &self,
        photographer_id: Uuid,
        amount: i64,
        source: EntrySource,
        correlation: CorrelationKey,
    ) -> Result<ConsumeOutcome, LedgerError> {
        let mut tx = self.db.begin().await?;
        let outcome = Self::consume_in_tx(&mut tx, photographer_id, amount, source, correlation).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Consume inside a caller-owned transaction; settlement runs this in
    /// the same transaction as the intent status transition.
    pub async fn consume_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        photographer_id: Uuid,
        amount: i64,
        source: EntrySource,
        correlation: CorrelationKey,
    ) -> Result<ConsumeOutcome, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        if let Some(existing) = Self::find_by_correlation_tx(tx, &correlation).await? {
            return Ok(ConsumeOutcome::AlreadyConsumed(existing));
        }

        // Lock the open grants. This is the per-photographer serialization
        // point for all balance mutations.
        let open_grants: Vec<OpenGrant> = sqlx::query_as(
            r#"
            SELECT id, amount, expires_at, issued_at
            FROM ledger_entries
            WHERE photographer_id = $1
              AND amount > 0
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY expires_at ASC NULLS LAST, issued_at ASC
            FOR UPDATE
            "#,
        )
        .bind(photographer_id)
        .fetch_all(&mut **tx)
        .await?;

        let available: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM ledger_entries
            WHERE photographer_id = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(photographer_id)
        .fetch_one(&mut **tx)
        .await?;

        if available < amount {
            return Err(LedgerError::InsufficientFunds { available, requested: amount });
        }

        // Debits carry the expiry of the grant they consume, which keeps the
        // expiry-sweep arithmetic exact per expiry class.
        let consumed_by_class = Self::consumed_by_expiry_class(tx, photographer_id).await?;
        let inherited_expiry = inherit_expiry(&open_grants, &consumed_by_class, amount);

        let inserted = Self::insert_entry(
            tx,
            photographer_id,
            -amount,
            EntryType::Debit,
            source,
            &correlation,
            inherited_expiry,
            None,
        )
        .await?;

        match inserted {
            Some(entry) => {
                Self::apply_balance_cache(tx, photographer_id, -amount).await?;
                record_ledger_entry(EntryType::Debit.as_str());
                Ok(ConsumeOutcome::Consumed(entry))
            }
            None => {
                let existing = Self::find_by_correlation_tx(tx, &correlation)
                    .await?
                    .ok_or(sqlx::Error::RowNotFound)?;
                Ok(ConsumeOutcome::AlreadyConsumed(existing))
            }
        }
    }

    // ========================================================================
    // BALANCE
    // ========================================================================

    /// Authoritative spendable balance: the sum over non-expired entries.
    pub async fn balance(&self, photographer_id: Uuid) -> Result<i64, LedgerError> {
        let balance: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM ledger_entries
            WHERE photographer_id = $1
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(photographer_id)
        .fetch_one(&self.db)
        .await?;
        Ok(balance)
    }

    pub async fn balance_detail(&self, photographer_id: Uuid) -> Result<BalanceDetail, LedgerError> {
        let balance = self.balance(photographer_id).await?;
        let nearest_expiry: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT MIN(expires_at)
            FROM ledger_entries
            WHERE photographer_id = $1
              AND amount > 0
              AND expires_at > NOW()
            "#,
        )
        .bind(photographer_id)
        .fetch_one(&self.db)
        .await?;
        Ok(BalanceDetail { balance, nearest_expiry })
    }

    /// Lookup an entry by its external correlation.
    pub async fn find_by_correlation(
        &self,
        correlation: &CorrelationKey,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let mut tx = self.db.begin().await?;
        let found = Self::find_by_correlation_tx(&mut tx, correlation).await?;
        tx.commit().await?;
        Ok(found)
    }

    // ========================================================================
    // EXPIRY SWEEP
    // ========================================================================

    /// Convert the unspent remainder of expired grants into offsetting
    /// `expiry_adjust` entries, one per grant, keyed by the grant id so the
    /// adjustment is one-shot. Returns the number of adjustments written.
    pub async fn expiry_sweep(&self, now: DateTime<Utc>) -> Result<u64, LedgerError> {
        let classes: Vec<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT DISTINCT g.photographer_id, g.expires_at
            FROM ledger_entries g
            WHERE g.amount > 0
              AND g.expires_at IS NOT NULL
              AND g.expires_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM ledger_entries a WHERE a.expired_grant_id = g.id
              )
            "#,
        )
        .bind(now)
        .fetch_all(&self.db)
        .await?;

        let mut written = 0u64;
        for (photographer_id, expires_at) in classes {
            written += self.sweep_class(photographer_id, expires_at).await?;
        }
        Ok(written)
    }

    /// Sweep one (photographer, expiry) class. Grants sharing an expiry
    /// absorb that class's debits FIFO by issue time; whatever is left per
    /// grant becomes its adjustment.
    async fn sweep_class(
        &self,
        photographer_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<u64, LedgerError> {
        let mut tx = self.db.begin().await?;

        let grants: Vec<(Uuid, i64)> = sqlx::query_as(
            r#"
            SELECT id, amount
            FROM ledger_entries
            WHERE photographer_id = $1
              AND expires_at = $2
              AND amount > 0
            ORDER BY issued_at ASC
            FOR UPDATE
            "#,
        )
        .bind(photographer_id)
        .bind(expires_at)
        .fetch_all(&mut *tx)
        .await?;

        // Debits and refunds both consume the class; prior expiry
        // adjustments are excluded because their grants no-op on conflict.
        let consumed: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(-amount), 0)::BIGINT
            FROM ledger_entries
            WHERE photographer_id = $1
              AND amount < 0
              AND entry_type != 'expiry_adjust'
              AND expires_at = $2
            "#,
        )
        .bind(photographer_id)
        .bind(expires_at)
        .fetch_one(&mut *tx)
        .await?;

        let amounts: Vec<i64> = grants.iter().map(|(_, a)| *a).collect();
        let remainders = attribute_remainders(&amounts, consumed);

        let mut written = 0u64;
        let mut adjusted_total = 0i64;
        for ((grant_id, _), remainder) in grants.iter().zip(remainders) {
            if remainder <= 0 {
                continue;
            }
            let inserted = Self::insert_entry(
                &mut tx,
                photographer_id,
                -remainder,
                EntryType::ExpiryAdjust,
                EntrySource::AdminAdjustment,
                &CorrelationKey::ExpiredGrant(*grant_id),
                Some(expires_at),
                None,
            )
            .await?;
            if inserted.is_some() {
                written += 1;
                adjusted_total += remainder;
                record_ledger_entry(EntryType::ExpiryAdjust.as_str());
            }
        }

        if adjusted_total > 0 {
            // The cached column cannot expire passively; the sweep is where
            // the expired remainder leaves it.
            Self::apply_balance_cache(&mut tx, photographer_id, -adjusted_total).await?;
        }

        tx.commit().await?;
        if written > 0 {
            info!(
                photographer_id = %photographer_id,
                expires_at = %expires_at,
                adjustments = written,
                total = adjusted_total,
                "expiry sweep wrote adjustments"
            );
        }
        Ok(written)
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    pub(crate) async fn find_by_correlation_tx(
        tx: &mut Transaction<'_, Postgres>,
        correlation: &CorrelationKey,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let sql = format!(
            "SELECT {} FROM ledger_entries WHERE {} = $1",
            ENTRY_COLUMNS,
            correlation.column()
        );
        let query = sqlx::query_as::<_, LedgerEntry>(&sql);
        let found = if let Some(text) = correlation.text_value() {
            query.bind(text.to_string()).fetch_optional(&mut **tx).await?
        } else if let Some(id) = correlation.uuid_value() {
            query.bind(id).fetch_optional(&mut **tx).await?
        } else {
            unreachable!("correlation key carries either a text or uuid value")
        };
        Ok(found)
    }

    /// Insert one journal row. `ON CONFLICT DO NOTHING` on the correlation
    /// column keeps the transaction healthy when a concurrent writer wins;
    /// `None` means the caller should read back the winner's row.
    #[allow(clippy::too_many_arguments)]
    async fn insert_entry(
        tx: &mut Transaction<'_, Postgres>,
        photographer_id: Uuid,
        amount: i64,
        entry_type: EntryType,
        source: EntrySource,
        correlation: &CorrelationKey,
        expires_at: Option<DateTime<Utc>>,
        promo_code: Option<&str>,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO ledger_entries (
                id, photographer_id, amount, entry_type, source, expires_at,
                promo_code, {col}
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT ({col}) DO NOTHING
            RETURNING {cols}
            "#,
            col = correlation.column(),
            cols = ENTRY_COLUMNS,
        );

        let query = sqlx::query_as::<_, LedgerEntry>(&sql)
            .bind(Uuid::new_v4())
            .bind(photographer_id)
            .bind(amount)
            .bind(entry_type.as_str())
            .bind(source.as_str())
            .bind(expires_at)
            .bind(promo_code);

        let inserted = if let Some(text) = correlation.text_value() {
            query.bind(text.to_string()).fetch_optional(&mut **tx).await?
        } else if let Some(id) = correlation.uuid_value() {
            query.bind(id).fetch_optional(&mut **tx).await?
        } else {
            unreachable!("correlation key carries either a text or uuid value")
        };
        Ok(inserted)
    }

    async fn apply_balance_cache(
        tx: &mut Transaction<'_, Postgres>,
        photographer_id: Uuid,
        delta: i64,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE photographers SET balance = balance + $1 WHERE id = $2")
            .bind(delta)
            .bind(photographer_id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn consumed_by_expiry_class(
        tx: &mut Transaction<'_, Postgres>,
        photographer_id: Uuid,
    ) -> Result<HashMap<Option<DateTime<Utc>>, i64>, LedgerError> {
        let rows: Vec<(Option<DateTime<Utc>>, i64)> = sqlx::query_as(
            r#"
            SELECT expires_at, COALESCE(SUM(-amount), 0)::BIGINT
            FROM ledger_entries
            WHERE photographer_id = $1
              AND amount < 0
              AND entry_type != 'expiry_adjust'
            GROUP BY expires_at
            "#,
        )
        .bind(photographer_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows.into_iter().collect())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OpenGrant {
    #[allow(dead_code)]
    id: Uuid,
    amount: i64,
    expires_at: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    issued_at: DateTime<Utc>,
}

/// FIFO attribution: grants (already ordered) absorb `consumed` in order;
/// returns each grant's unspent remainder.
fn attribute_remainders(grant_amounts: &[i64], consumed: i64) -> Vec<i64> {
    let mut left = consumed.max(0);
    grant_amounts
        .iter()
        .map(|&amount| {
            let absorbed = left.min(amount);
            left -= absorbed;
            amount - absorbed
        })
        .collect()
}

/// Expiry the new debit inherits: the expiry of the open grant that covers
/// the last unit of the requested amount, with each grant's remaining
/// capacity reduced by the debits already attributed to its expiry class.
/// Uploads debit one credit at a time, so in practice this lands on a
/// single grant.
fn inherit_expiry(
    open_grants: &[OpenGrant],
    consumed_by_class: &HashMap<Option<DateTime<Utc>>, i64>,
    amount: i64,
) -> Option<DateTime<Utc>> {
    let mut class_budget: HashMap<Option<DateTime<Utc>>, i64> = consumed_by_class.clone();
    let mut needed = amount;
    let mut inherited = None;

    for grant in open_grants {
        let consumed_here = class_budget.entry(grant.expires_at).or_insert(0);
        let already = (*consumed_here).min(grant.amount);
        *consumed_here -= already;
        let remaining = grant.amount - already;
        if remaining <= 0 {
            continue;
        }
        let take = remaining.min(needed);
        needed -= take;
        inherited = grant.expires_at;
        if needed <= 0 {
            break;
        }
    }
    inherited
}
