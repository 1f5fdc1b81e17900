// ============================================================================
// LEDGER TESTS - journal idempotency, balance projection, expiry sweep
// ============================================================================

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use fotolio_ws::domains::ledger::{
        ConsumeOutcome, CorrelationKey, EntrySource, EntryType, GrantOutcome, LedgerError,
        LedgerService,
    };
    use sqlx::PgPool;
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

    fn session_key(tag: &str) -> String {
        format!("{}_{}", tag, Uuid::new_v4())
    }

    // ========================================================================
    // SCENARIO: happy purchase + consume (S1)
    // ========================================================================

    #[tokio::test]
    async fn test_purchase_then_three_uploads_leaves_97() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;
        let sess_a = session_key("sess_A");

        let outcome = ledger
            .grant(
                photographer,
                100,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(sess_a.clone()),
                Some(Utc::now() + Duration::days(365)),
                None,
            )
            .await
            .expect("grant failed");
        assert!(matches!(outcome, GrantOutcome::Granted(_)));

        for _ in 0..3 {
            let outcome = ledger
                .consume(
                    photographer,
                    1,
                    EntrySource::Upload,
                    CorrelationKey::UploadIntent(Uuid::new_v4()),
                )
                .await
                .expect("consume failed");
            assert!(matches!(outcome, ConsumeOutcome::Consumed(_)));
        }

        assert_eq!(ledger.balance(photographer).await.unwrap(), 97);

        let entries: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE photographer_id = $1")
                .bind(photographer)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(entries, 4); // one +100 grant, three -1 debits
    }

    // ========================================================================
    // SCENARIO: duplicate webhook delivery (S2)
    // ========================================================================

    #[tokio::test]
    async fn test_duplicate_grant_converges_to_single_row() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;
        let sess = session_key("sess_dup");

        let first = ledger
            .grant(
                photographer,
                100,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(sess.clone()),
                None,
                None,
            )
            .await
            .unwrap();
        let second = ledger
            .grant(
                photographer,
                100,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(sess.clone()),
                None,
                None,
            )
            .await
            .unwrap();

        assert!(matches!(first, GrantOutcome::Granted(_)));
        let GrantOutcome::AlreadyGranted(existing) = second else {
            panic!("second delivery must resolve to the existing entry");
        };
        assert_eq!(existing.amount, 100);

        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE stripe_session_id = $1")
                .bind(&sess)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(rows, 1);
        assert_eq!(ledger.balance(photographer).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_duplicate_consume_converges_to_single_debit() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;

        ledger
            .grant(
                photographer,
                10,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(session_key("sess")),
                None,
                None,
            )
            .await
            .unwrap();

        let intent_id = Uuid::new_v4();
        let first = ledger
            .consume(photographer, 1, EntrySource::Upload, CorrelationKey::UploadIntent(intent_id))
            .await
            .unwrap();
        let second = ledger
            .consume(photographer, 1, EntrySource::Upload, CorrelationKey::UploadIntent(intent_id))
            .await
            .unwrap();

        assert!(matches!(first, ConsumeOutcome::Consumed(_)));
        assert!(matches!(second, ConsumeOutcome::AlreadyConsumed(_)));
        assert_eq!(ledger.balance(photographer).await.unwrap(), 9);
    }

    // ========================================================================
    // SCENARIO: concurrent consumes race for the last credit (S4 core)
    // ========================================================================

    #[tokio::test]
    async fn test_concurrent_consume_with_one_credit() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;

        let ledger = LedgerService::new(db.clone());
        ledger
            .grant(
                photographer,
                1,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(session_key("sess_race")),
                None,
                None,
            )
            .await
            .unwrap();

        let ledger_a = LedgerService::new(db.clone());
        let ledger_b = LedgerService::new(db.clone());
        let (a, b) = tokio::join!(
            ledger_a.consume(
                photographer,
                1,
                EntrySource::Upload,
                CorrelationKey::UploadIntent(Uuid::new_v4()),
            ),
            ledger_b.consume(
                photographer,
                1,
                EntrySource::Upload,
                CorrelationKey::UploadIntent(Uuid::new_v4()),
            ),
        );

        let winners = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Ok(ConsumeOutcome::Consumed(_))))
            .count();
        let losers = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(LedgerError::InsufficientFunds { .. })))
            .count();

        assert_eq!(winners, 1, "exactly one settlement may debit the last credit");
        assert_eq!(losers, 1, "the other must observe insufficient funds");
        assert_eq!(ledger.balance(photographer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_consume_without_funds_is_rejected() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;

        let result = ledger
            .consume(photographer, 1, EntrySource::Upload, CorrelationKey::UploadIntent(Uuid::new_v4()))
            .await;
        assert!(matches!(result, Err(LedgerError::InsufficientFunds { available: 0, requested: 1 })));
    }

    // ========================================================================
    // EXPIRY SWEEP
    // ========================================================================

    #[tokio::test]
    async fn test_expiry_sweep_writes_one_shot_adjustment() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;

        // A grant that expired an hour ago with nothing consumed.
        let outcome = ledger
            .grant(
                photographer,
                10,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(session_key("sess_exp")),
                Some(Utc::now() - Duration::hours(1)),
                None,
            )
            .await
            .unwrap();
        let grant_id = outcome.entry().id;

        let written = ledger.expiry_sweep(Utc::now()).await.unwrap();
        assert!(written >= 1);

        let adjust: (i64, String) = sqlx::query_as(
            "SELECT amount, entry_type FROM ledger_entries WHERE expired_grant_id = $1",
        )
        .bind(grant_id)
        .fetch_one(&db)
        .await
        .expect("adjustment row must exist");
        assert_eq!(adjust.0, -10);
        assert_eq!(adjust.1, "expiry_adjust");

        // Second sweep is a no-op for this grant.
        ledger.expiry_sweep(Utc::now()).await.unwrap();
        let adjust_rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE expired_grant_id = $1")
                .bind(grant_id)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(adjust_rows, 1);

        // Expired grant and its adjustment contribute nothing spendable.
        assert_eq!(ledger.balance(photographer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_balance_excludes_expired_grants() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;

        ledger
            .grant(
                photographer,
                40,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(session_key("sess_live")),
                Some(Utc::now() + Duration::days(30)),
                None,
            )
            .await
            .unwrap();
        ledger
            .grant(
                photographer,
                60,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(session_key("sess_dead")),
                Some(Utc::now() - Duration::days(1)),
                None,
            )
            .await
            .unwrap();

        assert_eq!(ledger.balance(photographer).await.unwrap(), 40);

        let detail = ledger.balance_detail(photographer).await.unwrap();
        assert_eq!(detail.balance, 40);
        assert!(detail.nearest_expiry.is_some());
    }

    // ========================================================================
    // REPLAY IN ARBITRARY ORDER
    // ========================================================================

    #[tokio::test]
    async fn test_replaying_operations_in_any_order_is_stable() {
        let db = setup_test_db().await;
        let ledger = LedgerService::new(db.clone());
        let photographer = create_test_photographer(&db).await;

        let sess_1 = session_key("sess_r1");
        let sess_2 = session_key("sess_r2");
        let intent = Uuid::new_v4();

        let grant_1 = || {
            ledger.grant(
                photographer,
                5,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(sess_1.clone()),
                None,
                None,
            )
        };
        let grant_2 = || {
            ledger.grant(
                photographer,
                7,
                EntryType::Purchase,
                EntrySource::Purchase,
                CorrelationKey::StripeSession(sess_2.clone()),
                None,
                None,
            )
        };
        let debit = || {
            ledger.consume(photographer, 1, EntrySource::Upload, CorrelationKey::UploadIntent(intent))
        };

        grant_1().await.unwrap();
        grant_2().await.unwrap();
        debit().await.unwrap();
        let balance_after_first_pass = ledger.balance(photographer).await.unwrap();

        // Replay everything, shuffled.
        debit().await.unwrap();
        grant_2().await.unwrap();
        grant_1().await.unwrap();
        debit().await.unwrap();

        assert_eq!(ledger.balance(photographer).await.unwrap(), balance_after_first_pass);
        assert_eq!(balance_after_first_pass, 11);

        let rows: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM ledger_entries WHERE photographer_id = $1")
                .bind(photographer)
                .fetch_one(&db)
                .await
                .unwrap();
        assert_eq!(rows, 3);
    }
}
