use anyhow::{Context, Result};
use std::env;

// ============================================================================
// APP CONFIG - read once at startup, carried in AppState
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub port: u16,
    pub stripe: StripeConfig,
    pub apple: AppleConfig,
    pub auth: AuthConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub frontend_base_url: String,
}

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Override for tests; defaults to the public API host.
    pub api_base_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppleEnvironment {
    Sandbox,
    Production,
}

impl AppleEnvironment {
    pub fn api_base_url(self) -> &'static str {
        match self {
            AppleEnvironment::Sandbox => "https://api.storekit-sandbox.itunes.apple.com",
            AppleEnvironment::Production => "https://api.storekit.itunes.apple.com",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppleConfig {
    /// DER-encoded Apple root CA, loaded from disk at startup.
    pub root_cert_der: Vec<u8>,
    pub bundle_id: String,
    pub environment: AppleEnvironment,
    pub api_key_id: String,
    pub api_issuer_id: String,
    /// ES256 private key (PEM) for the store server API client token.
    pub api_private_key_pem: String,
    /// Override for tests; defaults to the environment's host.
    pub api_base_url: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub webhook_secret: String,
    pub jwt_secret: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
    pub webhook_secret: String,
    /// Override for tests; defaults to the R2 account endpoint.
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub retention_days: i64,
    pub cleanup_batch_size: i64,
}

fn required(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{} must be set", name))
}

fn optional(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let storage_account_id = required("R2_ACCOUNT_ID")?;
        let storage_endpoint = optional(
            "R2_ENDPOINT",
            &format!("https://{}.r2.cloudflarestorage.com", storage_account_id),
        );

        let apple_environment = match optional("APPLE_ENVIRONMENT", "sandbox").as_str() {
            "production" => AppleEnvironment::Production,
            "sandbox" => AppleEnvironment::Sandbox,
            other => anyhow::bail!("APPLE_ENVIRONMENT must be 'sandbox' or 'production', got '{}'", other),
        };
        let apple_root_cert_path = required("APPLE_ROOT_CERT_PATH")?;
        let root_cert_der = std::fs::read(&apple_root_cert_path)
            .with_context(|| format!("failed to read Apple root cert at {}", apple_root_cert_path))?;

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            db_max_connections: optional("DB_MAX_CONNECTIONS", "20")
                .parse()
                .context("DB_MAX_CONNECTIONS must be an integer")?,
            port: optional("PORT", "8000").parse().context("PORT must be a u16")?,
            stripe: StripeConfig {
                secret_key: required("STRIPE_SECRET_KEY")?,
                webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
                api_base_url: optional("STRIPE_API_BASE_URL", "https://api.stripe.com"),
            },
            apple: AppleConfig {
                root_cert_der,
                bundle_id: required("APPLE_BUNDLE_ID")?,
                environment: apple_environment,
                api_key_id: required("APPLE_API_KEY_ID")?,
                api_issuer_id: required("APPLE_API_ISSUER_ID")?,
                api_private_key_pem: required("APPLE_API_PRIVATE_KEY")?,
                api_base_url: optional("APPLE_API_BASE_URL", apple_environment.api_base_url()),
            },
            auth: AuthConfig {
                webhook_secret: required("AUTH_WEBHOOK_SECRET")?,
                jwt_secret: required("JWT_SECRET")?,
            },
            storage: StorageConfig {
                account_id: storage_account_id,
                access_key_id: required("R2_ACCESS_KEY_ID")?,
                secret_access_key: required("R2_SECRET_ACCESS_KEY")?,
                bucket: required("R2_BUCKET")?,
                region: optional("R2_REGION", "auto"),
                webhook_secret: required("STORAGE_WEBHOOK_SECRET")?,
                endpoint: storage_endpoint,
            },
            retention: RetentionConfig {
                retention_days: optional("RETENTION_DAYS", "30")
                    .parse()
                    .context("RETENTION_DAYS must be an integer")?,
                cleanup_batch_size: optional("CLEANUP_BATCH_SIZE", "200")
                    .parse()
                    .context("CLEANUP_BATCH_SIZE must be an integer")?,
            },
            frontend_base_url: optional("FRONTEND_BASE_URL", "http://localhost:3000"),
        })
    }
}
