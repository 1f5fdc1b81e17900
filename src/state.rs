use reqwest::Client as ReqwestClient;
use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::create_db_pool;
use crate::domains::credits::CheckoutService;
use crate::domains::ledger::LedgerService;
use crate::domains::uploads::UploadIntentService;
use crate::services::consumption_reporter::ConsumptionReporter;
use crate::services::storage_service::StorageService;
use crate::webhook::StoreJwsVerifier;

/// Shared application state: the database pool, the outbound HTTP client,
/// the domain services and the cached store verifier. There is no other
/// cross-request mutable state; coordination goes through the database.
pub struct AppState {
    pub config: AppConfig,
    pub db_pool: PgPool,
    pub http_client: ReqwestClient,
    pub ledger: Arc<LedgerService>,
    pub intents: Arc<UploadIntentService>,
    pub checkout: Arc<CheckoutService>,
    pub storage: Arc<StorageService>,
    pub reporter: Arc<ConsumptionReporter>,
    pub store_verifier: Arc<StoreJwsVerifier>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let db_pool = create_db_pool(&config.database_url, config.db_max_connections).await?;

        let http_client = ReqwestClient::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("Failed to build Reqwest client");

        let ledger = Arc::new(LedgerService::new(db_pool.clone()));
        let storage = Arc::new(StorageService::new(config.storage.clone(), http_client.clone()));
        let intents = Arc::new(UploadIntentService::new(
            db_pool.clone(),
            storage.clone(),
            ledger.clone(),
        ));
        let checkout = Arc::new(CheckoutService::new(
            db_pool.clone(),
            http_client.clone(),
            config.stripe.clone(),
            config.frontend_base_url.clone(),
        ));
        let reporter = Arc::new(ConsumptionReporter::new(
            db_pool.clone(),
            http_client.clone(),
            config.apple.clone(),
        ));

        // Built once per configuration; rebuilt only on restart.
        let store_verifier = Arc::new(StoreJwsVerifier::new(&config.apple));

        Ok(AppState {
            config,
            db_pool,
            http_client,
            ledger,
            intents,
            checkout,
            storage,
            reporter,
            store_verifier,
        })
    }
}
