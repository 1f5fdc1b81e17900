pub mod intent_service;
pub mod models;

pub use intent_service::UploadIntentService;
pub use models::{IntentError, IntentStatus, SettleOutcome, UploadIntent};
