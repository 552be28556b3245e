use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use delivery::DeliveryStatsSnapshot;
use serde::{Deserialize, Serialize};

use crate::ApiState;

#[derive(Debug, Serialize, Deserialize)]
pub struct LiveTaskResponse {
    pub test_id: String,
    pub kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub delivery: DeliveryStatsSnapshot,
    pub queue_depth: usize,
    pub live_tasks: Vec<LiveTaskResponse>,
}

pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Delivery counters and the live task registry
pub async fn stats(State(state): State<ApiState>) -> Json<StatsResponse> {
    let pool = state.orchestrator.pool();
    let live_tasks = state
        .orchestrator
        .live_tasks()
        .into_iter()
        .map(|(id, kind)| LiveTaskResponse {
            test_id: id.to_string(),
            kind: kind.as_str().to_string(),
        })
        .collect();

    Json(StatsResponse {
        delivery: pool.stats().snapshot(),
        queue_depth: pool.queue_depth(),
        live_tasks,
    })
}
