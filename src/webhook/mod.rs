pub mod apple_jws;
pub mod handlers;
pub mod routes;
pub mod signature;

pub use apple_jws::StoreJwsVerifier;
pub use routes::create_webhook_router;
