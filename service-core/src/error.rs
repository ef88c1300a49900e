use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Machine-readable failure class for an external payment gateway call.
///
/// Only `Transient` failures are eligible for local retry; `Auth` and
/// `Rejected` are surfaced to the caller immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Auth,
    Transient,
    Rejected,
}

impl GatewayErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayErrorKind::Auth => "AUTH",
            GatewayErrorKind::Transient => "TRANSIENT",
            GatewayErrorKind::Rejected => "REJECTED",
        }
    }
}

impl std::fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("Conflict: {0}")]
    Conflict(anyhow::Error),

    #[error("Overpayment: {0}")]
    Overpayment(anyhow::Error),

    #[error("Gateway error [{kind}]: {message}")]
    Gateway {
        kind: GatewayErrorKind,
        message: String,
    },

    #[error("Invalid signature: {0}")]
    SignatureInvalid(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Configuration error: {0}")]
    ConfigError(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    pub fn gateway(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        AppError::Gateway {
            kind,
            message: message.into(),
        }
    }

    /// Build a field-level validation error outside of derive-based
    /// validation (e.g. for decimal amount checks).
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        let mut errors = validator::ValidationErrors::new();
        let mut error = validator::ValidationError::new("invalid");
        error.message = Some(std::borrow::Cow::Owned(message.into()));
        errors.add(field, error);
        AppError::ValidationError(errors)
    }

    /// True for gateway failures the caller may retry with backoff.
    pub fn is_transient_gateway(&self) -> bool {
        matches!(
            self,
            AppError::Gateway {
                kind: GatewayErrorKind::Transient,
                ..
            }
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(anyhow::Error::new(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let (status, error_message, details) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
            ),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string(), None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None),
            AppError::Conflict(err) => (StatusCode::CONFLICT, err.to_string(), None),
            AppError::Overpayment(err) => {
                (StatusCode::UNPROCESSABLE_ENTITY, err.to_string(), None)
            }
            AppError::Gateway { kind, message } => (
                StatusCode::BAD_GATEWAY,
                format!("Gateway error: {}", message),
                Some(kind.as_str().to_string()),
            ),
            AppError::SignatureInvalid(err) => {
                (StatusCode::UNAUTHORIZED, err.to_string(), None)
            }
            AppError::DatabaseError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
            ),
            AppError::ConfigError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Configuration error".to_string(),
                Some(err.to_string()),
            ),
            AppError::InternalError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(err.to_string()),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error: error_message,
                details,
            }),
        )
            .into_response()
    }
}
