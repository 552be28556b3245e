use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{TestId, TestStatus};
use crate::store::StoreError;

/// A single rejected input field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Outcomes of core operations other than success
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {}", format_fields(.0))]
    Validation(Vec<FieldError>),

    #[error("cannot {operation} test {test_id} in status {status}")]
    StateConflict {
        test_id: TestId,
        status: TestStatus,
        operation: &'static str,
    },

    #[error("test {0} not found")]
    NotFound(TestId),

    #[error("persistence failure: {0}")]
    Persistence(StoreError),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

fn format_fields(fields: &[FieldError]) -> String {
    fields
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation(vec![FieldError::new(field, message)])
    }

    pub fn conflict(test_id: &TestId, status: TestStatus, operation: &'static str) -> Self {
        CoreError::StateConflict {
            test_id: test_id.clone(),
            status,
            operation,
        }
    }

    /// Stable category name used in error payloads
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation_error",
            CoreError::StateConflict { .. } => "state_conflict",
            CoreError::NotFound(_) => "not_found",
            CoreError::Persistence(_) => "persistence_failure",
            CoreError::Unexpected(_) => "unexpected_failure",
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => CoreError::NotFound(id),
            other => CoreError::Persistence(other),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
