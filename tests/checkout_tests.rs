// ============================================================================
// CHECKOUT TESTS - gateway session creation with promo reservation
// ============================================================================

#[cfg(test)]
mod tests {
    use fotolio_ws::config::StripeConfig;
    use fotolio_ws::domains::credits::{CheckoutError, CheckoutService};
    use fotolio_ws::domains::promo::PromoError;
    use serde_json::json;
    use sqlx::PgPool;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    async fn create_gift_code(db: &PgPool) -> String {
        let code = format!("GIFT-{}", &Uuid::new_v4().simple().to_string()[..8].to_uppercase());
        sqlx::query(
            r#"
            INSERT INTO promo_codes
                (code, kind, grant_credits, grant_expires_days, max_redemptions,
                 max_redemptions_per_user, active)
            VALUES ($1, 'gift', 25, 90, 100, 1, TRUE)
            "#,
        )
        .bind(&code)
        .execute(db)
        .await
        .expect("Failed to create gift code");
        code
    }

    fn checkout_service(db: PgPool, gateway_url: String) -> CheckoutService {
        CheckoutService::new(
            db,
            reqwest::Client::new(),
            StripeConfig {
                secret_key: "sk_test_123".to_string(),
                webhook_secret: "whsec_test".to_string(),
                api_base_url: gateway_url,
            },
            "http://localhost:3000".to_string(),
        )
    }

    // ========================================================================
    // TESTS
    // ========================================================================

    #[tokio::test]
    async fn test_checkout_reserves_promo_slot_with_session() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db).await;
        let session_id = format!("cs_test_{}", Uuid::new_v4().simple());

        let gateway = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": session_id,
                "url": "https://checkout.example/pay/cs_test"
            })))
            .mount(&gateway)
            .await;

        let service = checkout_service(db.clone(), gateway.uri());
        let created =
            service.create_checkout(photographer, 100, Some(&code)).await.expect("checkout failed");

        assert_eq!(created.session_id, session_id);
        assert_eq!(created.preview.original_amount, created.preview.final_amount);
        assert_eq!(created.preview.bonus_credits, 25);

        let (status, promo): (String, Option<String>) = sqlx::query_as(
            "SELECT status, promo_code FROM checkout_sessions WHERE session_id = $1",
        )
        .bind(&session_id)
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(status, "open");
        assert_eq!(promo.as_deref(), Some(code.as_str()));

        let usages: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM promo_usages WHERE code = $1 AND stripe_session_id = $2",
        )
        .bind(&code)
        .bind(&session_id)
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(usages, 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_rolls_back_promo_reservation() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db).await;

        let gateway = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("gateway exploded"))
            .mount(&gateway)
            .await;

        let service = checkout_service(db.clone(), gateway.uri());
        let result = service.create_checkout(photographer, 100, Some(&code)).await;
        assert!(matches!(result, Err(CheckoutError::Gateway(_))));

        // The usage slot must not survive the failed gateway call.
        let usages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM promo_usages WHERE code = $1")
            .bind(&code)
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(usages, 0);

        // And the code stays redeemable afterwards.
        let session_id = format!("cs_test_{}", Uuid::new_v4().simple());
        gateway.reset().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": session_id,
                "url": "https://checkout.example/pay/retry"
            })))
            .mount(&gateway)
            .await;
        assert!(service.create_checkout(photographer, 100, Some(&code)).await.is_ok());
    }

    #[tokio::test]
    async fn test_checkout_rejects_out_of_range_amount() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let gateway = MockServer::start().await;
        let service = checkout_service(db.clone(), gateway.uri());

        let result = service.create_checkout(photographer, 0, None).await;
        assert!(matches!(result, Err(CheckoutError::InvalidAmount(0))));
        let result = service.create_checkout(photographer, 999_999, None).await;
        assert!(matches!(result, Err(CheckoutError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_second_checkout_with_used_code_conflicts() {
        let db = setup_test_db().await;
        let photographer = create_test_photographer(&db).await;
        let code = create_gift_code(&db).await;
        let session_id = format!("cs_test_{}", Uuid::new_v4().simple());

        let gateway = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": session_id,
                "url": "https://checkout.example/pay"
            })))
            .mount(&gateway)
            .await;

        let service = checkout_service(db.clone(), gateway.uri());
        service.create_checkout(photographer, 10, Some(&code)).await.expect("first use");

        let second = service.create_checkout(photographer, 10, Some(&code)).await;
        assert!(matches!(second, Err(CheckoutError::Promo(PromoError::AlreadyUsed))));
    }
}
