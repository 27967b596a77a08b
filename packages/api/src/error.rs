// ABOUTME: API error type mapping claim failures onto HTTP responses
// ABOUTME: Every failure is returned as a structured JSON body with a machine-readable code

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use stratus_executions::ClaimError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Claim(#[from] ClaimError),

    #[error("Invalid request body: {0}")]
    InvalidBody(String),
}

/// Structured error response format
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Convert to HTTP status code and machine-readable code
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Claim(claim) => {
                let status = match claim {
                    ClaimError::Unauthorized => StatusCode::UNAUTHORIZED,
                    ClaimError::NotFound(_) => StatusCode::NOT_FOUND,
                    ClaimError::Conflict(_) => StatusCode::CONFLICT,
                    ClaimError::Forbidden(_) => StatusCode::FORBIDDEN,
                    ClaimError::BadRequest(_) => StatusCode::BAD_REQUEST,
                    ClaimError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, claim.code())
            }
            ApiError::InvalidBody(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
        }
    }

    /// Sanitized message for external consumption
    fn to_user_message(&self) -> String {
        match self {
            ApiError::Claim(ClaimError::Internal(_)) => {
                "An internal server error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.to_status_and_code();

        if status.is_server_error() {
            error!("Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: ErrorDetail {
                code,
                message: self.to_user_message(),
            },
        };
        (status, Json(body)).into_response()
    }
}
