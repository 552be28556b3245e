use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{NewTest, RestartOverrides, Test, TestFilter};
use serde::{Deserialize, Serialize};

use super::parse_id;
use crate::ApiState;
use crate::error::ApiFailure;

type ApiResult<T> = Result<T, ApiFailure>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTestsResponse {
    pub tests: Vec<Test>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub at: DateTime<Utc>,
}

/// List tests, optionally filtered by `owner` and `status`
pub async fn list_tests(
    State(state): State<ApiState>,
    filter: Result<Query<TestFilter>, QueryRejection>,
) -> ApiResult<Json<ListTestsResponse>> {
    let Query(filter) = filter?;
    let tests = state.orchestrator.get_all_tests(&filter).await?;
    Ok(Json(ListTestsResponse { tests }))
}

/// Create a pending test
pub async fn create_test(
    State(state): State<ApiState>,
    request: Result<Json<NewTest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Test>)> {
    let Json(request) = request?;
    let test = state.orchestrator.create_test(request).await?;
    Ok((StatusCode::CREATED, Json(test)))
}

pub async fn get_test(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Test>> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.get_test_by_id(&id).await?))
}

pub async fn start_test(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Test>)> {
    let id = parse_id(&id)?;
    let test = state.orchestrator.get_test_by_id(&id).await?;
    state.orchestrator.start_test(test).await?;
    let test = state.orchestrator.get_test_by_id(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(test)))
}

pub async fn schedule_test(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    request: Result<Json<ScheduleRequest>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Test>)> {
    let id = parse_id(&id)?;
    let Json(request) = request?;
    state.orchestrator.schedule_test(&id, request.at).await?;
    let test = state.orchestrator.get_test_by_id(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(test)))
}

pub async fn cancel_test(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Test>> {
    let id = parse_id(&id)?;
    state.orchestrator.cancel_test(&id).await?;
    Ok(Json(state.orchestrator.get_test_by_id(&id).await?))
}

/// Restart a finished test; the body carries optional rate/duration overrides
pub async fn restart_test(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    request: Result<Json<RestartOverrides>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Test>)> {
    let id = parse_id(&id)?;
    let Json(overrides) = request?;
    state.orchestrator.restart_test(&id, overrides).await?;
    let test = state.orchestrator.get_test_by_id(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(test)))
}

pub async fn save_results(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Test>> {
    let id = parse_id(&id)?;
    Ok(Json(state.orchestrator.save_results(&id).await?))
}
