use reqwest::Client;
use serde::Deserialize;
use sqlx::PgPool;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::StripeConfig;
use crate::domains::ledger::{CorrelationKey, LedgerService};
use crate::domains::promo::{PromoService, ResolvedPromo};

use super::models::{
    CheckoutCreated, CheckoutError, CheckoutPreview, CheckoutSession, PurchaseStatus,
    CREDIT_UNIT_PRICE_MINOR, MAX_CHECKOUT_CREDITS, MIN_CHECKOUT_CREDITS,
};

#[derive(Debug, Deserialize)]
struct StripeSessionResponse {
    id: String,
    url: String,
}

/// Creates gateway checkout sessions and answers post-redirect polling.
/// Promo resolution and the usage-slot reservation run inside the same
/// transaction as the gateway call, so a failed call rolls everything back.
pub struct CheckoutService {
    db: PgPool,
    http: Client,
    stripe: StripeConfig,
    frontend_base_url: String,
}

impl CheckoutService {
    pub fn new(db: PgPool, http: Client, stripe: StripeConfig, frontend_base_url: String) -> Self {
        Self { db, http, stripe, frontend_base_url }
    }

    pub async fn create_checkout(
        &self,
        photographer_id: Uuid,
        credit_amount: i64,
        promo_code: Option<&str>,
    ) -> Result<CheckoutCreated, CheckoutError> {
        if !(MIN_CHECKOUT_CREDITS..=MAX_CHECKOUT_CREDITS).contains(&credit_amount) {
            return Err(CheckoutError::InvalidAmount(credit_amount));
        }

        let mut tx = self.db.begin().await?;

        // Resolving inside the transaction locks the code row; the usage slot
        // below is reserved atomically with the gateway-side session.
        let resolved = match promo_code {
            Some(code) => Some(PromoService::resolve_in_tx(&mut tx, code, photographer_id).await?),
            None => None,
        };
        let preview = compute_preview(credit_amount, resolved.as_ref());

        let session = self
            .create_gateway_session(photographer_id, credit_amount, preview.final_amount, promo_code)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO checkout_sessions (session_id, photographer_id, credit_amount, amount_total, promo_code)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&session.id)
        .bind(photographer_id)
        .bind(credit_amount)
        .bind(preview.final_amount)
        .bind(promo_code.map(|c| c.trim().to_uppercase()))
        .execute(&mut *tx)
        .await?;

        if let Some(code) = promo_code {
            PromoService::record_usage_in_tx(&mut tx, code, photographer_id, Some(&session.id))
                .await?;
        }

        tx.commit().await?;

        info!(
            photographer_id = %photographer_id,
            session_id = %session.id,
            credits = credit_amount,
            "checkout session created"
        );
        Ok(CheckoutCreated { checkout_url: session.url, session_id: session.id, preview })
    }

    /// Post-redirect polling: fulfilled once the grant keyed by the session
    /// id exists in the ledger.
    pub async fn purchase_status(
        &self,
        photographer_id: Uuid,
        session_id: &str,
        ledger: &LedgerService,
    ) -> Result<PurchaseStatus, CheckoutError> {
        let session: Option<CheckoutSession> = sqlx::query_as(
            r#"
            SELECT session_id, photographer_id, credit_amount, amount_total, promo_code, status, created_at
            FROM checkout_sessions
            WHERE session_id = $1 AND photographer_id = $2
            "#,
        )
        .bind(session_id)
        .bind(photographer_id)
        .fetch_optional(&self.db)
        .await?;
        let session = session.ok_or(CheckoutError::SessionNotFound)?;

        let grant = ledger
            .find_by_correlation(&CorrelationKey::StripeSession(session_id.to_string()))
            .await
            .map_err(|e| match e {
                crate::domains::ledger::LedgerError::Database(db) => CheckoutError::Database(db),
                other => CheckoutError::Gateway(other.to_string()),
            })?;

        Ok(match grant {
            Some(entry) => PurchaseStatus {
                fulfilled: true,
                credits: entry.amount,
                expires_at: entry.expires_at,
            },
            None => PurchaseStatus { fulfilled: false, credits: session.credit_amount, expires_at: None },
        })
    }

    async fn create_gateway_session(
        &self,
        photographer_id: Uuid,
        credit_amount: i64,
        final_amount: i64,
        promo_code: Option<&str>,
    ) -> Result<StripeSessionResponse, CheckoutError> {
        let success_url =
            format!("{}/credits/success?session_id={{CHECKOUT_SESSION_ID}}", self.frontend_base_url);
        let cancel_url = format!("{}/credits/cancelled", self.frontend_base_url);
        let credits = credit_amount.to_string();
        let unit_amount = final_amount.to_string();
        let quantity = "1";

        let mut form: Vec<(&str, &str)> = vec![
            ("mode", "payment"),
            ("success_url", &success_url),
            ("cancel_url", &cancel_url),
            ("line_items[0][price_data][currency]", "usd"),
            ("line_items[0][price_data][product_data][name]", "Photo credits"),
            ("line_items[0][price_data][unit_amount]", &unit_amount),
            ("line_items[0][quantity]", quantity),
            ("metadata[credits]", &credits),
        ];
        let photographer = photographer_id.to_string();
        form.push(("metadata[photographer_id]", &photographer));
        let normalized;
        if let Some(code) = promo_code {
            normalized = code.trim().to_uppercase();
            form.push(("metadata[promo_code]", &normalized));
        }

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.stripe.api_base_url))
            .basic_auth(&self.stripe.secret_key, None::<&str>)
            .form(&form)
            .send()
            .await
            .map_err(|e| CheckoutError::Gateway(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(%status, "gateway rejected checkout session: {}", body);
            return Err(CheckoutError::Gateway(format!("gateway returned {}", status)));
        }

        response.json::<StripeSessionResponse>().await.map_err(|e| {
            error!("gateway session response unparsable: {}", e);
            CheckoutError::Gateway("unparsable gateway response".to_string())
        })
    }
}

/// Price math for the client preview. Discounts reduce the payable amount,
/// gifts add bonus credits on top of the purchase; a code is one or the
/// other, never both.
pub fn compute_preview(credit_amount: i64, resolved: Option<&ResolvedPromo>) -> CheckoutPreview {
    let original_amount = credit_amount * CREDIT_UNIT_PRICE_MINOR;
    let mut final_amount = original_amount;
    let mut discount_percent = 0;
    let mut bonus_credits = 0;

    match resolved {
        Some(ResolvedPromo::Discount { percent_off, amount_off_minor }) => {
            if let Some(percent) = percent_off {
                discount_percent = *percent;
                final_amount = original_amount - (original_amount * (*percent as i64)) / 100;
            } else if let Some(off) = amount_off_minor {
                final_amount = (original_amount - off).max(0);
            }
        }
        Some(ResolvedPromo::Gift { grant_credits, .. }) => {
            bonus_credits = *grant_credits;
        }
        None => {}
    }

    let total_credits = credit_amount + bonus_credits;
    let effective_rate =
        if total_credits > 0 { final_amount as f64 / total_credits as f64 } else { 0.0 };

    CheckoutPreview {
        original_amount,
        final_amount,
        discount_percent,
        bonus_credits,
        credit_amount,
        effective_rate,
    }
}
