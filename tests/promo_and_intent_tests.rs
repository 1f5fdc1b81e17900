// ============================================================================
// PROMO & UPLOAD INTENT TESTS - redemption caps, presign gating
// ============================================================================

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use fotolio_ws::config::StorageConfig;
    use fotolio_ws::domains::ledger::{CorrelationKey, EntrySource, EntryType, LedgerService};
    use fotolio_ws::domains::promo::{PromoError, PromoService, ResolvedPromo};
    use fotolio_ws::domains::uploads::{IntentError, UploadIntentService};
    use fotolio_ws::services::storage_service::StorageService;
    use sqlx::PgPool;
    use std::sync::Arc;
    use uuid::Uuid;

    // ========================================================================
    // HELPER FUNCTIONS
    // ========================================================================

    async fn setup_test_db() -> PgPool {
        let database_url = std::env::var("DATABASE_URL")
            .expect("DATABASE_URL must be set for integration tests");

        PgPool::connect(&database_url)
            .await
            .expect("Failed to connect to test database")
    }

    async fn create_test_photographer(db: &PgPool) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO photographers (id, auth_user_id, email, display_name)
            VALUES ($1, $2, $3, 'Test Photographer')
            "#,
        )
        .bind(id)
        .bind(format!("auth_{}", id))
        .bind(format!("{}@example.com", id))
        .execute(db)
        .await
        .expect("Failed to create test photographer");
        id
    }

    async fn create_test_event(db: &PgPool, photographer_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO events (id, photographer_id, name, expires_at)
            VALUES ($1, $2, 'Test Wedding', NOW() + INTERVAL '30 days')
            "#,
        )
        .bind(id)
        .bind(photographer_id)
        .execute(db)
        .await
        .expect("Failed to create test event");
        id
    }

    async fn create_gift_code(db: &PgPool, per_user_cap: i32) -> String {
        let code = format!("GIFT-{}", &Uuid::new_v4().simple().to_string()[..8].to_uppercase());
        sqlx::query(
            r#"
            INSERT INTO promo_codes
                (code, kind, grant_credits, grant_expires_days, max_redemptions,
                 max_redemptions_per_user, active)
            VALUES ($1, 'gift', 25, 90, 100, $2, TRUE)
            "#,
        )
        .bind(&code)
        .bind(per_user_cap)
        .execute(db)
        .await
        .expect("Failed to create gift code");
        code
    }

    fn test_storage_service() -> Arc<StorageService> {
        Arc::new(StorageService::new(
            StorageConfig {
                account_id: "test".to_string(),
                access_key_id: "AKIDTEST".to_string(),
                secret_access_key: "secret".to_string(),
                bucket: "photos-test".to_string(),
                region: "auto".to_string(),
                webhook_secret: "unused".to_string(),
                endpoint: "https://test.r2.cloudflarestorage.com".to_string(),
            },
            reqwest::Client::new(),
        ))
    }

    // ========================================================================
    // SCENARIO: gift code single use per photographer (S6)
    // ========================================================================

    #[tokio::test]
    async fn test_gift_code_second_use_conflicts() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db, 1).await;

        // First checkout: resolve and reserve the slot.
        let mut tx = db.begin().await.unwrap();
        let resolved = PromoService::resolve_in_tx(&mut tx, &code, photographer).await.unwrap();
        assert_eq!(resolved, ResolvedPromo::Gift { grant_credits: 25, expires_days: Some(90) });
        PromoService::record_usage_in_tx(&mut tx, &code, photographer, Some("cs_test_1"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Second checkout with the same code: rejected before any gateway call.
        let mut tx = db.begin().await.unwrap();
        let second = PromoService::resolve_in_tx(&mut tx, &code, photographer).await;
        assert!(matches!(second, Err(PromoError::AlreadyUsed)));
        tx.rollback().await.unwrap();

        let usages: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM promo_usages WHERE code = $1")
                .bind(&code)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(usages, 1);
    }

    #[tokio::test]
    async fn test_usage_unique_index_backstops_direct_insert() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db, 1).await;

        let mut tx = db.begin().await.unwrap();
        PromoService::record_usage_in_tx(&mut tx, &code, photographer, Some("cs_backstop_1"))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        // Bypass the count check: the unique index still refuses the row.
        let mut tx = db.begin().await.unwrap();
        let second =
            PromoService::record_usage_in_tx(&mut tx, &code, photographer, Some("cs_backstop_2"))
                .await;
        assert!(matches!(second, Err(PromoError::AlreadyUsed)));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_code_is_matched_case_insensitively() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db, 1).await;

        let mut tx = db.begin().await.unwrap();
        let resolved =
            PromoService::resolve_in_tx(&mut tx, &code.to_lowercase(), photographer).await;
        assert!(resolved.is_ok());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_and_expired_codes_rejected() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db, 1).await;

        sqlx::query("UPDATE promo_codes SET expires_at = NOW() - INTERVAL '1 day' WHERE code = $1")
            .bind(&code)
            .execute(&db)
            .await
            .unwrap();
        let mut tx = db.begin().await.unwrap();
        let result = PromoService::resolve_in_tx(&mut tx, &code, photographer).await;
        assert!(matches!(result, Err(PromoError::Expired)));
        tx.rollback().await.unwrap();

        sqlx::query("UPDATE promo_codes SET expires_at = NULL, active = FALSE WHERE code = $1")
            .bind(&code)
            .execute(&db)
            .await
            .unwrap();
        let mut tx = db.begin().await.unwrap();
        let result = PromoService::resolve_in_tx(&mut tx, &code, photographer).await;
        assert!(matches!(result, Err(PromoError::Invalid)));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_allow_list_excludes_outsiders() {
        let db = setup_test_db().await;
        let insider = create_test_photographer(&db).await;
        let outsider = create_test_photographer(&db).await;
        let code = create_gift_code(&db, 1).await;

        sqlx::query("UPDATE promo_codes SET target_photographer_ids = ARRAY[$1]::uuid[] WHERE code = $2")
            .bind(insider)
            .bind(&code)
            .execute(&db)
            .await
            .unwrap();

        let mut tx = db.begin().await.unwrap();
        assert!(PromoService::resolve_in_tx(&mut tx, &code, insider).await.is_ok());
        let result = PromoService::resolve_in_tx(&mut tx, &code, outsider).await;
        assert!(matches!(result, Err(PromoError::NotEligible)));
        tx.rollback().await.unwrap();
    }

    // ========================================================================
    // SCENARIO: presign with zero balance (S5)
    // ========================================================================

    #[tokio::test]
    async fn test_presign_with_zero_balance_inserts_nothing() {
        let db = setup_test_db().await;
        let ledger = Arc::new(LedgerService::new(db.clone()));
        let intents = UploadIntentService::new(db.clone(), test_storage_service(), ledger.clone());
        let photographer = create_test_photographer(&db).await;
        let event = create_test_event(&db, photographer).await;

        let result = intents
            .create_presign(photographer, event, "image/jpeg", 1024, None)
            .await;
        assert!(matches!(result, Err(IntentError::InsufficientCredits)));

        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM upload_intents WHERE event_id = $1")
                .bind(event)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn test_presign_with_balance_creates_pending_intent() {
        let db = setup_test_db().await;
        let ledger = Arc::new(LedgerService::new(db.clone()));
        let intents = UploadIntentService::new(db.clone(), test_storage_service(), ledger.clone());
        let photographer = create_test_photographer(&db).await;
        let event = create_test_event(&db, photographer).await;

        ledger
            .grant(
                photographer,
                5,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(format!("sess_presign_{}", Uuid::new_v4())),
                None,
                None,
            )
            .await
            .unwrap();

        let (intent, presigned) = intents
            .create_presign(photographer, event, "image/jpeg", 1024, Some("web"))
            .await
            .expect("presign should succeed with balance");

        assert_eq!(intent.status, "pending");
        assert_eq!(intent.content_length, 1024);
        assert!(presigned.url.contains(&intent.object_key));
        assert!(presigned
            .required_headers
            .contains(&("If-None-Match".to_string(), "*".to_string())));

        // The advisory check never debits; settlement owns the debit.
        assert_eq!(ledger.balance(photographer).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_presign_for_foreign_event_is_forbidden() {
        let db = setup_test_db().await;
        let ledger = Arc::new(LedgerService::new(db.clone()));
        let intents = UploadIntentService::new(db.clone(), test_storage_service(), ledger.clone());
        let owner = create_test_photographer(&db).await;
        let stranger = create_test_photographer(&db).await;
        let event = create_test_event(&db, owner).await;

        let result = intents.create_presign(stranger, event, "image/jpeg", 1024, None).await;
        assert!(matches!(result, Err(IntentError::NotOwner)));
    }

    #[tokio::test]
    async fn test_represign_rotates_key_and_cancel_is_terminal() {
        let db = setup_test_db().await;
        let ledger = Arc::new(LedgerService::new(db.clone()));
        let intents = UploadIntentService::new(db.clone(), test_storage_service(), ledger.clone());
        let photographer = create_test_photographer(&db).await;
        let event = create_test_event(&db, photographer).await;

        ledger
            .grant(
                photographer,
                1,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(format!("sess_rot_{}", Uuid::new_v4())),
                None,
                None,
            )
            .await
            .unwrap();

        let (intent, _) =
            intents.create_presign(photographer, event, "image/png", 2048, None).await.unwrap();

        let (rotated, _) = intents.represign(photographer, intent.id).await.unwrap();
        assert_eq!(rotated.id, intent.id);
        assert_ne!(rotated.object_key, intent.object_key);
        assert_eq!(rotated.status, "pending");

        let cancelled = intents.cancel(photographer, intent.id).await.unwrap();
        assert_eq!(cancelled.status, "cancelled");

        // Terminal states refuse another URL.
        let result = intents.represign(photographer, intent.id).await;
        assert!(matches!(result, Err(IntentError::InvalidState(_))));
    }
}
