pub mod admin;
pub mod lifecycle;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use common::TestId;

use crate::error::ApiFailure;

pub(crate) fn parse_id(raw: &str) -> Result<TestId, ApiFailure> {
    raw.parse()
        .map_err(|e| ApiFailure::invalid("id", format!("not a valid test id: {e}")))
}

impl From<JsonRejection> for ApiFailure {
    fn from(rejection: JsonRejection) -> Self {
        ApiFailure::invalid("body", rejection.body_text())
    }
}

impl From<QueryRejection> for ApiFailure {
    fn from(rejection: QueryRejection) -> Self {
        ApiFailure::invalid("query", rejection.body_text())
    }
}
