use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// JWT Claims structure matching the session token payload.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct JwtClaims {
    /// Photographer id as a string.
    pub sub: String,
    pub email: String,
    pub exp: i64,
    pub iat: i64,
}

pub const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

/// Authenticated principal carried in request extensions.
#[derive(Debug, Clone)]
pub struct CurrentPhotographer {
    pub id: Uuid,
    pub email: String,
}

#[derive(Debug, sqlx::FromRow)]
struct PhotographerGate {
    banned_at: Option<chrono::DateTime<chrono::Utc>>,
    deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Extract and validate the bearer token, resolve the photographer row and
/// stash a `CurrentPhotographer` for handlers.
pub async fn extract_current_photographer(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .ok_or_else(|| {
            warn!("Missing Authorization header");
            ApiError::unauthorized("Authentication required")
        })?;

    if !auth_header.starts_with("Bearer ") {
        warn!("Invalid Authorization header format");
        return Err(ApiError::unauthorized("Authorization header must use the Bearer scheme"));
    }

    let token = auth_header.trim_start_matches("Bearer ").trim();
    if token.is_empty() {
        return Err(ApiError::unauthorized("Empty bearer token"));
    }

    let decoding_key = DecodingKey::from_secret(state.config.auth.jwt_secret.as_bytes());
    let validation = Validation::new(JWT_ALGORITHM);

    let token_data = decode::<JwtClaims>(token, &decoding_key, &validation).map_err(|e| {
        // Log the detail, return a generic message to the client.
        error!("JWT validation failed: {}", e);
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ApiError::unauthorized("Session expired")
            }
            _ => ApiError::unauthorized("Could not validate credentials"),
        }
    })?;

    let claims = token_data.claims;
    let photographer_id = Uuid::parse_str(&claims.sub).map_err(|_| {
        error!("Invalid photographer id in JWT sub field: {}", claims.sub);
        ApiError::unauthorized("Could not validate credentials")
    })?;

    let gate: Option<PhotographerGate> =
        sqlx::query_as("SELECT banned_at, deleted_at FROM photographers WHERE id = $1")
            .bind(photographer_id)
            .fetch_optional(&state.db_pool)
            .await?;

    match gate {
        Some(g) if g.deleted_at.is_none() && g.banned_at.is_none() => {}
        Some(_) => return Err(ApiError::forbidden("Account disabled")),
        None => return Err(ApiError::unauthorized("Could not validate credentials")),
    }

    request
        .extensions_mut()
        .insert(CurrentPhotographer { id: photographer_id, email: claims.email });

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    #[test]
    fn test_jwt_round_trip() {
        let secret = "test-session-secret";
        let photographer_id = Uuid::new_v4();
        let claims = JwtClaims {
            sub: photographer_id.to_string(),
            email: "ansel@example.com".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
            iat: chrono::Utc::now().timestamp(),
        };

        let token = encode(
            &Header::new(JWT_ALGORITHM),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let decoded = decode::<JwtClaims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::new(JWT_ALGORITHM),
        )
        .unwrap();
        assert_eq!(decoded.claims.sub, photographer_id.to_string());
        assert_eq!(decoded.claims.email, "ansel@example.com");
    }

    #[test]
    fn test_jwt_rejects_wrong_secret() {
        let claims = JwtClaims {
            sub: Uuid::new_v4().to_string(),
            email: "ansel@example.com".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp(),
            iat: chrono::Utc::now().timestamp(),
        };
        let token = encode(
            &Header::new(JWT_ALGORITHM),
            &claims,
            &EncodingKey::from_secret(b"secret-a"),
        )
        .unwrap();
        let result = decode::<JwtClaims>(
            &token,
            &DecodingKey::from_secret(b"secret-b"),
            &Validation::new(JWT_ALGORITHM),
        );
        assert!(result.is_err());
    }
}
