use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use coach_core::error::{self, ApiError};

use crate::analysis::SubmitError;
use crate::ledger::LedgerError;
use crate::store::StoreError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Validation error (400)
    Validation {
        message: String,
        field: Option<String>,
        received: Option<serde_json::Value>,
        docs_hint: Option<String>,
    },
    /// Missing or unusable credentials (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// No credits or daily allowance left (402)
    QuotaExhausted { message: String },
    /// Resource not found, or owned by someone else (404)
    NotFound { resource: String },
    /// A dependency the request needs is not configured (503)
    ServiceUnavailable { message: String },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

fn envelope(code: &str, message: String, request_id: String) -> ApiError {
    ApiError {
        error: code.to_string(),
        message,
        field: None,
        received: None,
        request_id,
        docs_hint: None,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::now_v7().to_string();

        let (status, api_error) = match self {
            AppError::Validation {
                message,
                field,
                received,
                docs_hint,
            } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: error::codes::VALIDATION_FAILED.to_string(),
                    message,
                    field,
                    received,
                    request_id,
                    docs_hint,
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    docs_hint,
                    ..envelope(error::codes::AUTH_REQUIRED, message, request_id)
                },
            ),
            AppError::QuotaExhausted { message } => (
                StatusCode::PAYMENT_REQUIRED,
                ApiError {
                    docs_hint: Some(
                        "Wait for the daily allowance to reset, add credits, or supply your own \
                         provider key via the x-provider-key header."
                            .to_string(),
                    ),
                    ..envelope(error::codes::QUOTA_EXHAUSTED, message, request_id)
                },
            ),
            AppError::NotFound { resource } => (
                StatusCode::NOT_FOUND,
                envelope(
                    error::codes::NOT_FOUND,
                    format!("{resource} not found"),
                    request_id,
                ),
            ),
            AppError::ServiceUnavailable { message } => {
                tracing::warn!("Service unavailable: {}", message);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    envelope(error::codes::SERVICE_UNAVAILABLE, message, request_id),
                )
            }
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    envelope(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    envelope(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred".to_string(),
                        request_id,
                    ),
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(err) => AppError::Database(err),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Database(err) => AppError::Database(err),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<SubmitError> for AppError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::QuotaExhausted(reason) => AppError::QuotaExhausted {
                message: reason.to_string(),
            },
            SubmitError::AuthRequired => AppError::Unauthorized {
                message: "This account analyses with its own provider key".to_string(),
                docs_hint: Some(
                    "Send your provider key in the x-provider-key header.".to_string(),
                ),
            },
            SubmitError::NoPlatformCredentials => AppError::ServiceUnavailable {
                message: "Analysis is temporarily unavailable without a caller-supplied provider key"
                    .to_string(),
            },
            SubmitError::Ledger(err) => err.into(),
            SubmitError::Store(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use coach_core::quota::DenialReason;

    use super::AppError;
    use crate::analysis::SubmitError;

    fn status_of(err: impl Into<AppError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn submit_errors_map_to_stable_statuses() {
        assert_eq!(
            status_of(SubmitError::QuotaExhausted(DenialReason::NoCredits)),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_of(SubmitError::AuthRequired),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_of(SubmitError::NoPlatformCredentials),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn not_found_is_404() {
        let response = AppError::NotFound {
            resource: "analysis job".to_string(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
