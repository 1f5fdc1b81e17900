pub mod auth;

pub use auth::{extract_current_photographer, CurrentPhotographer, JwtClaims};
