use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::AppleConfig;

// ============================================================================
// CONSUMPTION REPORTER - answers the store's "how much was used?" follow-up
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumptionStatus {
    NotConsumed,
    PartiallyConsumed,
    FullyConsumed,
}

impl ConsumptionStatus {
    /// Store wire codes (0 is "undeclared" and never sent).
    pub fn wire_code(self) -> u8 {
        match self {
            ConsumptionStatus::NotConsumed => 1,
            ConsumptionStatus::PartiallyConsumed => 2,
            ConsumptionStatus::FullyConsumed => 3,
        }
    }
}

/// Classification over ledger sums; pure so the boundary cases stay pinned
/// by tests.
pub fn classify(granted: i64, consumed_since: i64) -> ConsumptionStatus {
    if consumed_since <= 0 {
        ConsumptionStatus::NotConsumed
    } else if consumed_since >= granted {
        ConsumptionStatus::FullyConsumed
    } else {
        ConsumptionStatus::PartiallyConsumed
    }
}

#[derive(Debug, Error)]
pub enum ReporterError {
    #[error("storage unavailable: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store API error: {0}")]
    StoreApi(String),

    #[error("client token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Serialize)]
struct StoreApiClaims<'a> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: &'a str,
    bid: &'a str,
}

#[derive(Debug, sqlx::FromRow)]
struct GrantRow {
    photographer_id: uuid::Uuid,
    amount: i64,
    issued_at: chrono::DateTime<Utc>,
}

/// Read-only reporter: computes consumption for a store transaction from
/// the ledger and pushes the answer to the store's follow-up API. Never
/// mutates state.
pub struct ConsumptionReporter {
    db: PgPool,
    http: Client,
    apple: AppleConfig,
}

impl ConsumptionReporter {
    pub fn new(db: PgPool, http: Client, apple: AppleConfig) -> Self {
        Self { db, http, apple }
    }

    /// Answer a consumption request for the given original transaction.
    /// Returns `None` when no grant matches (the store will ask again after
    /// the purchase notification lands).
    pub async fn report(
        &self,
        original_transaction_id: &str,
    ) -> Result<Option<ConsumptionStatus>, ReporterError> {
        let grant: Option<GrantRow> = sqlx::query_as(
            r#"
            SELECT photographer_id, amount, issued_at
            FROM ledger_entries
            WHERE apple_transaction_id = $1 AND amount > 0
            "#,
        )
        .bind(original_transaction_id)
        .fetch_optional(&self.db)
        .await?;

        let Some(grant) = grant else {
            warn!(
                transaction_id = original_transaction_id,
                "consumption request for unknown transaction, skipping"
            );
            return Ok(None);
        };

        let consumed_since: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(-amount), 0)::BIGINT
            FROM ledger_entries
            WHERE photographer_id = $1
              AND source = 'upload'
              AND amount < 0
              AND issued_at >= $2
            "#,
        )
        .bind(grant.photographer_id)
        .bind(grant.issued_at)
        .fetch_one(&self.db)
        .await?;

        let status = classify(grant.amount, consumed_since);
        self.send(original_transaction_id, grant.photographer_id, status).await?;

        info!(
            transaction_id = original_transaction_id,
            consumed = consumed_since,
            granted = grant.amount,
            "consumption reported"
        );
        Ok(Some(status))
    }

    async fn send(
        &self,
        transaction_id: &str,
        photographer_id: uuid::Uuid,
        status: ConsumptionStatus,
    ) -> Result<(), ReporterError> {
        let token = self.client_token()?;
        let body = json!({
            "customerConsented": true,
            "consumptionStatus": status.wire_code(),
            "deliveryStatus": 0,
            "sampleContentProvided": false,
            "platform": 1,
            "appAccountToken": photographer_id.to_string(),
        });

        let response = self
            .http
            .put(format!(
                "{}/inApps/v1/transactions/consumption/{}",
                self.apple.api_base_url, transaction_id
            ))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| ReporterError::StoreApi(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReporterError::StoreApi(format!(
                "store API returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// ES256 client token for the store server API, short-lived per call.
    fn client_token(&self) -> Result<String, ReporterError> {
        let now = Utc::now().timestamp();
        let claims = StoreApiClaims {
            iss: &self.apple.api_issuer_id,
            iat: now,
            exp: now + 20 * 60,
            aud: "appstoreconnect-v1",
            bid: &self.apple.bundle_id,
        };
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.apple.api_key_id.clone());
        let key = EncodingKey::from_ec_pem(self.apple.api_private_key_pem.as_bytes())?;
        Ok(encode(&header, &claims, &key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_consumed() {
        assert_eq!(classify(100, 0), ConsumptionStatus::NotConsumed);
    }

    #[test]
    fn test_classify_partial() {
        assert_eq!(classify(100, 1), ConsumptionStatus::PartiallyConsumed);
        assert_eq!(classify(100, 99), ConsumptionStatus::PartiallyConsumed);
    }

    #[test]
    fn test_classify_full_at_and_past_boundary() {
        assert_eq!(classify(100, 100), ConsumptionStatus::FullyConsumed);
        assert_eq!(classify(100, 250), ConsumptionStatus::FullyConsumed);
    }

    #[test]
    fn test_wire_codes() {
        assert_eq!(ConsumptionStatus::NotConsumed.wire_code(), 1);
        assert_eq!(ConsumptionStatus::PartiallyConsumed.wire_code(), 2);
        assert_eq!(ConsumptionStatus::FullyConsumed.wire_code(), 3);
    }
}
