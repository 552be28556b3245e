use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use common::{CoreError, FieldError};
use serde::{Deserialize, Serialize};

/// Error payload returned by every endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    /// Error category
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Rejected fields, for validation errors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldError>>,
}

impl ApiError {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            fields: None,
        }
    }
}

/// A core outcome rendered as an HTTP error response
#[derive(Debug)]
pub struct ApiFailure(pub CoreError);

impl ApiFailure {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        ApiFailure(CoreError::validation(field, message))
    }
}

impl From<CoreError> for ApiFailure {
    fn from(err: CoreError) -> Self {
        ApiFailure(err)
    }
}

pub fn status_for(err: &CoreError) -> StatusCode {
    match err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::StateConflict { .. } => StatusCode::CONFLICT,
        CoreError::Persistence(_) | CoreError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(error = %self.0, kind = self.0.kind(), "Request failed");
        }

        let payload = match self.0 {
            CoreError::Validation(fields) => ApiError {
                error: "validation_error".to_string(),
                message: "request validation failed".to_string(),
                fields: Some(fields),
            },
            // internal details stay in the log
            CoreError::Persistence(_) => {
                ApiError::new("persistence_failure", "failed to persist test state")
            }
            CoreError::Unexpected(_) => {
                ApiError::new("unexpected_failure", "an unexpected error occurred")
            }
            other => ApiError::new(other.kind(), other.to_string()),
        };

        (status, Json(payload)).into_response()
    }
}
