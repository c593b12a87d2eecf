//! Custom error types exposed across the application.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The primary error type for the application.
///
/// Every variant corresponds to one of the error kinds in the router's
/// error-handling design. Kinds are stable and surfaced to callers; the raw
/// upstream message is only ever carried as free text inside the variant,
/// never interpreted by callers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed provider catalogue, unknown tier, or other invalid config.
    #[error("Configuration error: {0}")]
    ConfigInvalid(String),

    /// Error related to database operations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] crate::database::DbError),

    /// Bearer credential did not resolve to a key record.
    #[error("Unauthorized")]
    Unauthorized,

    /// Key resolved but its status is not `enabled`.
    #[error("API key is disabled")]
    KeyDisabled,

    /// Key resolved but has expired.
    #[error("API key has expired")]
    KeyExpired,

    /// Caller has exceeded their per-minute/hour/day request rate.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Caller's configured cost limit has already been met or exceeded.
    #[error("Cost limit exceeded")]
    CostLimitExceeded,

    /// Caller's daily or monthly quota has been exhausted.
    #[error("Quota exceeded")]
    QuotaExceeded,

    /// The requested model is not on the key's allow-list, or is blocked.
    #[error("Model forbidden for this key")]
    ModelForbidden,

    /// The requested endpoint is not on the key's allow-list.
    #[error("Endpoint forbidden for this key")]
    EndpointForbidden,

    /// No registered provider can serve the inferred task-type.
    #[error("No compatible provider for task type {0:?}")]
    NoCompatibleProvider(crate::models::TaskType),

    /// Every candidate provider was eliminated by hard constraints.
    #[error("Selection failed: all candidates were eliminated by constraints")]
    SelectionFailed,

    /// An upstream provider returned an error.
    #[error("Upstream provider failed: {0}")]
    UpstreamFailed(String),

    /// A deadline was exceeded.
    #[error("Deadline exceeded")]
    Timeout,

    /// The caller or a shutdown signal cancelled the operation.
    #[error("Cancelled")]
    Cancelled,

    /// An unexpected invariant was violated; logged with full context.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::ConfigInvalid(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
            AppError::DatabaseError(db_err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal database issue: {db_err}"),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::KeyDisabled | AppError::KeyExpired => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            AppError::CostLimitExceeded | AppError::QuotaExceeded => {
                (StatusCode::PAYMENT_REQUIRED, self.to_string())
            }
            AppError::ModelForbidden | AppError::EndpointForbidden => {
                (StatusCode::FORBIDDEN, self.to_string())
            }
            AppError::NoCompatibleProvider(_) | AppError::SelectionFailed => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            AppError::UpstreamFailed(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            AppError::Timeout => (StatusCode::GATEWAY_TIMEOUT, self.to_string()),
            AppError::Cancelled => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                self.to_string(),
            ),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({ "error": error_message, "kind": self.kind() }));
        (status, body).into_response()
    }
}

impl AppError {
    /// Returns the stable, machine-readable kind name for this error.
    ///
    /// This is what the Caller API contract surfaces to callers; the
    /// `Display` message may additionally carry a raw upstream detail.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigInvalid(_) => "ConfigInvalid",
            AppError::DatabaseError(_) => "Internal",
            AppError::Unauthorized => "Unauthorized",
            AppError::KeyDisabled => "KeyDisabled",
            AppError::KeyExpired => "KeyExpired",
            AppError::RateLimited => "RateLimited",
            AppError::CostLimitExceeded => "CostLimitExceeded",
            AppError::QuotaExceeded => "QuotaExceeded",
            AppError::ModelForbidden => "ModelForbidden",
            AppError::EndpointForbidden => "EndpointForbidden",
            AppError::NoCompatibleProvider(_) => "NoCompatibleProvider",
            AppError::SelectionFailed => "SelectionFailed",
            AppError::UpstreamFailed(_) => "UpstreamFailed",
            AppError::Timeout => "Timeout",
            AppError::Cancelled => "Cancelled",
            AppError::Internal(_) => "Internal",
        }
    }
}
