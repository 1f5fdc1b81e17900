pub mod checkout_service;
pub mod models;

pub use checkout_service::CheckoutService;
pub use models::{
    CheckoutCreated, CheckoutError, CheckoutPreview, PurchaseStatus, APPLE_PURCHASE_EXPIRY_DAYS,
    PURCHASE_EXPIRY_DAYS,
};
