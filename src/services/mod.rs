pub mod consumption_reporter;
pub mod queue;
pub mod scheduled_jobs_service;
pub mod settlement_worker;
pub mod storage_service;

pub use consumption_reporter::ConsumptionReporter;
pub use scheduled_jobs_service::{get_scheduled_jobs, init_scheduled_jobs};
pub use settlement_worker::start_queue_worker;
pub use storage_service::StorageService;
