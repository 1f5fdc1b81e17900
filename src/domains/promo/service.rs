use chrono::Utc;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::is_unique_violation;

use super::models::{PromoCode, PromoError, PromoUsage, ResolvedPromo};

const USAGE_COLUMNS: &str = "id, code, photographer_id, stripe_session_id, created_at";

/// Validates and applies gift/discount codes. Caps are checked by counting
/// the usage table; the unique indices on (code, photographer) and
/// (code, session) are the backstop for simultaneous redemptions.
pub struct PromoService {
    db: PgPool,
}

impl PromoService {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Validate a code for a photographer and return its effect. Codes are
    /// matched case-insensitively (stored uppercased).
    pub async fn resolve(
        &self,
        code: &str,
        photographer_id: Uuid,
    ) -> Result<ResolvedPromo, PromoError> {
        let mut tx = self.db.begin().await?;
        let resolved = Self::resolve_in_tx(&mut tx, code, photographer_id).await?;
        tx.commit().await?;
        Ok(resolved)
    }

    /// Resolve inside the checkout transaction, locking the code row so a
    /// concurrent redemption of a nearly-exhausted code serializes here.
    pub async fn resolve_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
        photographer_id: Uuid,
    ) -> Result<ResolvedPromo, PromoError> {
        let normalized = code.trim().to_uppercase();

        let promo: Option<PromoCode> = sqlx::query_as(
            r#"
            SELECT code, kind, grant_credits, grant_expires_days, percent_off,
                   amount_off_minor, expires_at, max_redemptions,
                   max_redemptions_per_user, target_photographer_ids, active,
                   created_at
            FROM promo_codes
            WHERE code = $1
            FOR UPDATE
            "#,
        )
        .bind(&normalized)
        .fetch_optional(&mut **tx)
        .await?;

        let promo = match promo {
            Some(p) if p.active => p,
            _ => return Err(PromoError::Invalid),
        };

        if promo.is_expired(Utc::now()) {
            return Err(PromoError::Expired);
        }
        if !promo.allows(photographer_id) {
            return Err(PromoError::NotEligible);
        }

        if let Some(max) = promo.max_redemptions {
            let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM promo_usages WHERE code = $1")
                .bind(&normalized)
                .fetch_one(&mut **tx)
                .await?;
            if total >= max as i64 {
                return Err(PromoError::GloballyExhausted);
            }
        }

        let per_user: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM promo_usages WHERE code = $1 AND photographer_id = $2",
        )
        .bind(&normalized)
        .bind(photographer_id)
        .fetch_one(&mut **tx)
        .await?;
        if per_user >= promo.max_redemptions_per_user as i64 {
            return Err(PromoError::AlreadyUsed);
        }

        Ok(promo_effect(&promo))
    }

    /// Reserve the usage slot. Runs in the checkout transaction so a failed
    /// gateway call rolls the reservation back; the unique indices turn a
    /// lost race into `AlreadyUsed`.
    pub async fn record_usage_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        code: &str,
        photographer_id: Uuid,
        stripe_session_id: Option<&str>,
    ) -> Result<PromoUsage, PromoError> {
        let normalized = code.trim().to_uppercase();
        let sql = format!(
            r#"
            INSERT INTO promo_usages (id, code, photographer_id, stripe_session_id)
            VALUES ($1, $2, $3, $4)
            RETURNING {USAGE_COLUMNS}
            "#
        );
        let usage: Result<PromoUsage, sqlx::Error> = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(&normalized)
            .bind(photographer_id)
            .bind(stripe_session_id)
            .fetch_one(&mut **tx)
            .await;

        match usage {
            Ok(u) => Ok(u),
            Err(e) if is_unique_violation(&e) => Err(PromoError::AlreadyUsed),
            Err(e) => Err(e.into()),
        }
    }

    /// Usage row for a completed checkout session, if the session carried a
    /// promo code.
    pub async fn usage_for_session(
        &self,
        session_id: &str,
    ) -> Result<Option<PromoUsage>, PromoError> {
        let sql = format!("SELECT {USAGE_COLUMNS} FROM promo_usages WHERE stripe_session_id = $1");
        let usage = sqlx::query_as(&sql)
            .bind(session_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(usage)
    }
}

fn promo_effect(promo: &PromoCode) -> ResolvedPromo {
    match promo.kind.as_str() {
        "gift" => ResolvedPromo::Gift {
            grant_credits: promo.grant_credits.unwrap_or(0),
            expires_days: promo.grant_expires_days,
        },
        _ => ResolvedPromo::Discount {
            percent_off: promo.percent_off,
            amount_off_minor: promo.amount_off_minor,
        },
    }
}
