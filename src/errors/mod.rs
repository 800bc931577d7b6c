//! Unified error handling with consistent API response envelope.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::services::patterns::ThreatFamily;
use crate::services::validator::IdentifierKind;

/// Error detail in the API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

/// Consistent JSON envelope for all API responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wrap a successful result in the envelope.
    pub fn success(data: T) -> Json<Self> {
        Json(Self {
            data: Some(data),
            error: None,
        })
    }

    /// Wrap an error in the envelope.
    pub fn error(code: &str, message: &str) -> Json<Self> {
        Json(Self {
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        })
    }
}

/// Input rejection raised by the validator.
///
/// `Display` is for operators; use [`ValidationError::user_message`] for anything
/// shown to end users so payloads are never echoed back.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid {kind} identifier: {reason}")]
    InvalidIdentifier { kind: IdentifierKind, reason: String },

    #[error("Input too long: {actual} characters (max {max})")]
    TooLong { max: usize, actual: usize },

    #[error("{family} detected by rule {rule}")]
    InjectionDetected { family: ThreatFamily, rule: String },

    #[error("Cross-site scripting detected by rule {rule}")]
    XssDetected { rule: String },

    #[error("Input nested deeper than {max} levels")]
    TooDeep { max: usize },
}

impl ValidationError {
    /// Generic rejection text safe to show to end users.
    pub fn user_message(&self) -> &'static str {
        "Invalid input"
    }

    /// Event type logged for this rejection.
    pub fn event_type(&self) -> &'static str {
        use crate::models::event::event_types;
        match self {
            Self::InvalidIdentifier { .. } | Self::TooDeep { .. } => {
                event_types::INVALID_IDENTIFIER
            }
            Self::TooLong { .. } => event_types::INPUT_TOO_LONG,
            Self::InjectionDetected { family, .. } => family.event_type(),
            Self::XssDetected { .. } => event_types::XSS_ATTEMPT,
        }
    }
}

/// Failure talking to the event store, counter cache or baseline cache.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Timed out after {0} ms")]
    Timeout(u64),
}

/// Failure delivering an alert through one notification channel.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("{channel} transport error: {message}")]
    Transport { channel: String, message: String },

    #[error("{channel} is not configured: {message}")]
    NotConfigured { channel: String, message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Application error type mapping to HTTP status codes.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Rejected input: {0}")]
    Rejected(#[from] ValidationError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Check if this error represents a not-found condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this error is an input rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Rejected(e) => (
                StatusCode::BAD_REQUEST,
                "INVALID_INPUT",
                e.user_message().to_string(),
            ),
            AppError::Store(e) => {
                tracing::error!(error = %e, "Store error");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "STORE_UNAVAILABLE",
                    "The event store is unavailable".to_string(),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                )
            }
        };

        let body = ApiResponse::<()> {
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message,
            }),
        };

        (status, Json(body)).into_response()
    }
}
