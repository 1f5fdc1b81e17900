pub mod models;
pub mod service;

pub use models::{PromoCode, PromoError, PromoUsage, ResolvedPromo};
pub use service::PromoService;
