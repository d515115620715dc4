use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tripwire_core::decision::DenyReason;
use tripwire_core::error::{self, ApiError, ValidationError};

use crate::engine::EngineError;
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
    /// Missing or invalid admin credential (401)
    Unauthorized {
        message: String,
        docs_hint: Option<String>,
    },
    /// Request denied by abuse enforcement (403 for blocks, 429 for limits)
    Denied {
        reason: DenyReason,
        retry_after_secs: u64,
    },
    /// Fixed per-route limit exceeded (429)
    RateLimited { retry_after_secs: u64 },
    /// Counter store unreachable on a read that must not pretend to be empty (503)
    StoreUnavailable(StoreError),
    /// Internal error (500)
    Internal(String),
}

impl AppError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
            received: None,
            docs_hint: None,
        }
    }
}

fn body(code: &str, message: impl Into<String>, request_id: String) -> ApiError {
    ApiError {
        error: code.to_string(),
        message: message.into(),
        field: None,
        received: None,
        request_id,
        docs_hint: None,
        retry_after_secs: None,
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
                    field,
                    received,
                    docs_hint,
                    ..body(error::codes::VALIDATION_FAILED, message, request_id)
                },
            ),
            AppError::Unauthorized { message, docs_hint } => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    docs_hint,
                    ..body(error::codes::UNAUTHORIZED, message, request_id)
                },
            ),
            AppError::Denied {
                reason,
                retry_after_secs,
            } => {
                let status = match reason {
                    DenyReason::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
                    DenyReason::GeoBlocked | DenyReason::IpBlocked => StatusCode::FORBIDDEN,
                };
                let message = match reason {
                    DenyReason::GeoBlocked => "Requests from this address are temporarily blocked",
                    DenyReason::IpBlocked => "This client is temporarily blocked",
                    DenyReason::RateLimitExceeded => "Too many requests",
                };
                return with_retry_after(
                    status,
                    ApiError {
                        retry_after_secs: Some(retry_after_secs),
                        ..body(reason.as_str(), message, request_id)
                    },
                    retry_after_secs,
                );
            }
            AppError::RateLimited { retry_after_secs } => {
                return with_retry_after(
                    StatusCode::TOO_MANY_REQUESTS,
                    ApiError {
                        retry_after_secs: Some(retry_after_secs),
                        docs_hint: Some(
                            "This route has a fixed request limit. Wait before retrying.".to_string(),
                        ),
                        ..body(error::codes::RATE_LIMITED, "Too many requests", request_id)
                    },
                    retry_after_secs,
                );
            }
            AppError::StoreUnavailable(err) => {
                tracing::error!(error = %err, "counter store unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiError {
                        docs_hint: Some(
                            "Abuse state could not be read. Retry once the counter store is reachable."
                                .to_string(),
                        ),
                        ..body(
                            error::codes::STORE_UNAVAILABLE,
                            "Counter store unavailable",
                            request_id,
                        )
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    body(
                        error::codes::INTERNAL_ERROR,
                        "An internal error occurred",
                        request_id,
                    ),
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}

fn with_retry_after(status: StatusCode, api_error: ApiError, retry_after_secs: u64) -> Response {
    let mut response = (status, Json(api_error)).into_response();
    response.headers_mut().insert(
        header::RETRY_AFTER,
        HeaderValue::from(retry_after_secs),
    );
    response
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::Validation {
            message: err.message,
            field: Some(err.field),
            received: err.received,
            docs_hint: None,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => AppError::StoreUnavailable(err),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Store(err) => err.into(),
            EngineError::Validation(err) => err.into(),
            EngineError::Encode(err) => AppError::Internal(err.to_string()),
        }
    }
}
