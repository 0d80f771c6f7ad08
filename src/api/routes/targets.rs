//! Scrape target endpoint

use axum::{Json, extract::State};

use crate::api::state::ApiState;
use crate::api::types::TargetsResponse;

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<ApiState>) -> Json<TargetsResponse> {
    let mut targets = state.targets.targets().await;
    targets.sort_by(|a, b| (&a.job, &a.url).cmp(&(&b.job, &b.url)));

    Json(TargetsResponse { targets })
}
