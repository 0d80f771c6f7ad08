//! Runtime status endpoint

use axum::{Json, extract::State};
use chrono::Utc;

use crate::api::state::ApiState;
use crate::api::types::{BuildInfo, QueueStatus, StatusResponse};

/// GET /api/v1/status
///
/// Build information, effective configuration, command line flags, start time,
/// sample queue depth and the shutdown state.
pub async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    let runtime = &state.runtime;

    Json(StatusResponse {
        build: BuildInfo::current(),
        birth: runtime.birth,
        uptime_secs: (Utc::now() - runtime.birth).num_seconds(),
        config: runtime.config.clone(),
        flags: runtime.flags.clone(),
        samples_queue: QueueStatus {
            depth: state.queue.len(),
            capacity: state.queue.capacity(),
        },
        shutdown_state: state.shutdown.state(),
    })
}
