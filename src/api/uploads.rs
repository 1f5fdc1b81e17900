use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::domains::ledger::LedgerError;
use crate::domains::uploads::{IntentError, UploadIntent};
use crate::error::ApiError;
use crate::middleware::CurrentPhotographer;
use crate::services::storage_service::PresignedUpload;
use crate::state::AppState;

// ============================================================================
// REQUEST / RESPONSE MODELS
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub event_id: Uuid,
    #[validate(length(min = 1, max = 100))]
    pub content_type: String,
    #[validate(range(min = 1, max = 52_428_800))] // MAX_CONTENT_LENGTH
    pub content_length: i64,
    pub source: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignResponse {
    pub upload_id: Uuid,
    pub put_url: String,
    pub object_key: String,
    pub expires_at: DateTime<Utc>,
    pub required_headers: HashMap<String, String>,
}

impl PresignResponse {
    fn new(intent: &UploadIntent, presigned: PresignedUpload) -> Self {
        Self {
            upload_id: intent.id,
            put_url: presigned.url,
            object_key: intent.object_key.clone(),
            expires_at: presigned.expires_at,
            required_headers: presigned.required_headers.into_iter().collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentSnapshot {
    pub upload_id: Uuid,
    pub event_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl From<UploadIntent> for IntentSnapshot {
    fn from(intent: UploadIntent) -> Self {
        Self {
            upload_id: intent.id,
            event_id: intent.event_id,
            status: intent.status,
            created_at: intent.created_at,
            completed_at: intent.completed_at,
            photo_id: intent.photo_id,
            error_code: intent.error_code,
            error_message: intent.error_message,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Comma-separated intent ids.
    pub ids: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub cursor: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentListResponse {
    pub intents: Vec<IntentSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

// ============================================================================
// ERROR TRANSLATION
// ============================================================================

impl From<IntentError> for ApiError {
    fn from(err: IntentError) -> Self {
        match err {
            IntentError::EventNotFound => ApiError::not_found("Event not found"),
            IntentError::IntentNotFound => ApiError::not_found("Upload not found"),
            IntentError::NotOwner => ApiError::forbidden("Not your event"),
            IntentError::EventExpired => ApiError::gone("Event has expired"),
            IntentError::UnsupportedContentType(t) => {
                ApiError::unprocessable(format!("Unsupported content type: {}", t))
            }
            IntentError::ContentTooLarge(_) => {
                ApiError::unprocessable("Content length exceeds the allowed maximum")
            }
            IntentError::EmptyContent => ApiError::bad_request("Content length must be positive"),
            IntentError::InsufficientCredits => {
                ApiError::payment_required("Insufficient credits")
            }
            IntentError::InvalidState(status) => {
                ApiError::conflict(format!("Upload is {}", status))
            }
            IntentError::InvalidCursor => ApiError::bad_request("Cursor unparsable"),
            IntentError::Ledger(LedgerError::InsufficientFunds { .. }) => {
                ApiError::payment_required("Insufficient credits")
            }
            IntentError::Ledger(LedgerError::Database(e)) => e.into(),
            IntentError::Ledger(_) => ApiError::internal("Internal error"),
            IntentError::Storage(e) => {
                tracing::error!("object store error at API boundary: {}", e);
                if e.is_transient() {
                    ApiError::service_unavailable("Object store temporarily unavailable")
                } else {
                    ApiError::bad_gateway("Object store rejected the request")
                }
            }
            IntentError::Database(e) => e.into(),
        }
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

pub async fn create_presign(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Json(request): Json<PresignRequest>,
) -> Result<(StatusCode, Json<PresignResponse>), ApiError> {
    request.validate().map_err(|e| ApiError::bad_request(e.to_string()))?;

    let (intent, presigned) = state
        .intents
        .create_presign(
            photographer.id,
            request.event_id,
            &request.content_type,
            request.content_length,
            request.source.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(PresignResponse::new(&intent, presigned))))
}

pub async fn represign(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Path(upload_id): Path<Uuid>,
) -> Result<(StatusCode, Json<PresignResponse>), ApiError> {
    let (intent, presigned) = state.intents.represign(photographer.id, upload_id).await?;
    Ok((StatusCode::CREATED, Json(PresignResponse::new(&intent, presigned))))
}

pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Path(upload_id): Path<Uuid>,
) -> Result<Json<IntentSnapshot>, ApiError> {
    let intent = state.intents.cancel(photographer.id, upload_id).await?;
    Ok(Json(intent.into()))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<Vec<IntentSnapshot>>, ApiError> {
    let ids: Vec<Uuid> = query
        .ids
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| Uuid::parse_str(s.trim()))
        .collect::<Result<_, _>>()
        .map_err(|_| ApiError::bad_request("ids must be a comma-separated list of UUIDs"))?;
    if ids.is_empty() || ids.len() > 100 {
        return Err(ApiError::bad_request("between 1 and 100 ids required"));
    }

    let intents = state.intents.status_batch(photographer.id, &ids).await?;
    Ok(Json(intents.into_iter().map(IntentSnapshot::from).collect()))
}

pub async fn list_for_event(
    State(state): State<Arc<AppState>>,
    Extension(photographer): Extension<CurrentPhotographer>,
    Path(event_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> Result<Json<IntentListResponse>, ApiError> {
    let (intents, next_cursor) = state
        .intents
        .list_intents(photographer.id, event_id, query.cursor.as_deref(), query.limit.unwrap_or(50))
        .await?;

    Ok(Json(IntentListResponse {
        intents: intents.into_iter().map(IntentSnapshot::from).collect(),
        next_cursor,
    }))
}

pub fn create_uploads_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/uploads/presign", post(create_presign))
        .route("/uploads/:id/presign", post(represign))
        .route("/uploads/:id/cancel", post(cancel))
        .route("/uploads/status", get(status))
        .route("/uploads/events/:event_id", get(list_for_event))
}
