//! Defines the API routes and handlers for the web server.
//!
//! The wire framing here is a thin, optional convenience: the router's
//! actual contract is the Caller API in `api.rs` (submit/query/cancel a
//! request, inspect/reload the provider catalogue, manage API keys).
//! Nothing in `executor`, `selector`, or `gate` depends on HTTP; every
//! handler below does nothing but translate between JSON/headers and a
//! [`RouterApi`] call.

use std::collections::HashMap;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    api::RouterApi,
    error::AppError,
    executor::{ExecutionReport, RequestStatus},
    gate::{KeyDescriptor, KeyValidation},
    models::Constraints,
    registry::{ProviderRecord, StaticSource},
};

/// Shared application state passed into route handlers: the Caller API.
pub type AppState = RouterApi;

/// Creates the main API router for the application.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/requests", post(submit_request))
        .route("/v1/requests/:id", get(query_request))
        .route("/v1/requests/:id", delete(cancel_request))
        .route("/v1/providers", get(list_providers))
        .route("/v1/providers/:name", get(get_provider))
        .route("/v1/providers/reload", post(reload_providers))
        .route("/v1/keys", post(create_key))
        .route("/v1/keys/:id", get(get_key))
        .route("/v1/keys/:id", delete(disable_key))
        .route("/v1/keys/:id/audit", get(key_audit))
        .route("/v1/keys/validate", post(validate_key))
        .with_state(state)
}

/// Caller-facing submission payload; `id` is assigned by the router.
#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    /// The raw natural-language prompt.
    pub prompt: String,
    /// Free-form contextual hints.
    #[serde(default)]
    pub context: HashMap<String, String>,
    /// Optional routing constraints.
    #[serde(default)]
    pub constraints: Constraints,
}

fn bearer_secret(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(AppError::Unauthorized)
}

async fn submit_request(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<ExecutionReport>, AppError> {
    let secret = bearer_secret(&headers)?;
    let report = state
        .submit_request(secret, payload.prompt, payload.context, payload.constraints)
        .await?;
    Ok(Json(report))
}

async fn query_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RequestStatus>, (StatusCode, &'static str)> {
    match state.query_request(id).await {
        Ok(Some(status)) => Ok(Json(status)),
        Ok(None) => Err((StatusCode::NOT_FOUND, "unknown request id")),
        Err(_) => Err((StatusCode::INTERNAL_SERVER_ERROR, "failed to read request status")),
    }
}

async fn cancel_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> StatusCode {
    if state.cancel_request(id) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderRecord>> {
    Json(state.list_providers())
}

async fn get_provider(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProviderRecord>, (StatusCode, &'static str)> {
    state
        .get_provider(&name)
        .map(Json)
        .ok_or((StatusCode::NOT_FOUND, "unknown provider"))
}

async fn reload_providers(State(state): State<AppState>, body: String) -> Result<StatusCode, AppError> {
    let providers = crate::registry::parse_csv_catalogue(&body)?;
    state.refresh_providers(&StaticSource(providers)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    owner: String,
}

#[derive(Debug, Serialize)]
struct CreateKeyResponse {
    id: String,
    secret: String,
}

async fn create_key(
    State(state): State<AppState>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<Json<CreateKeyResponse>, AppError> {
    let (secret, key) = state.create_key(&payload.owner).await?;
    Ok(Json(CreateKeyResponse { id: key.id, secret }))
}

async fn get_key(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<KeyDescriptor>, (StatusCode, &'static str)> {
    state.get_key(&id).map(Json).ok_or((StatusCode::NOT_FOUND, "unknown key"))
}

async fn disable_key(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    if state.disable_key(&id) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct ValidateKeyRequest {
    secret: String,
}

async fn validate_key(
    State(state): State<AppState>,
    Json(payload): Json<ValidateKeyRequest>,
) -> Json<KeyValidation> {
    Json(state.key_validate(&payload.secret))
}

async fn key_audit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<crate::audit::AuditEvent>>, AppError> {
    let events = state.key_audit(&id, 50).await?;
    Ok(Json(events))
}
