//! Storage and pipeline statistics endpoint

use axum::{Json, extract::State};

use crate::api::error::ApiResult;
use crate::api::state::ApiState;
use crate::api::types::{QueueStatus, StatsResponse};

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let storage = state.storage.stats().await?;

    Ok(Json(StatsResponse {
        timestamp: chrono::Utc::now().to_rfc3339(),
        storage,
        remote: state.remote.as_ref().map(|remote| remote.stats()),
        samples_queue: QueueStatus {
            depth: state.queue.len(),
            capacity: state.queue.capacity(),
        },
        targets: state.targets.collectors().len(),
    }))
}
