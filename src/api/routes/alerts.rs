//! Active alerts endpoint

use axum::{Json, extract::State};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;
use crate::api::types::AlertsResponse;

/// GET /api/v1/alerts
pub async fn list_alerts(State(state): State<ApiState>) -> ApiResult<Json<AlertsResponse>> {
    let alerts = state
        .rules
        .alerts()
        .await
        .map_err(|_| ApiError::Unavailable("rule manager is not running".to_string()))?;

    Ok(Json(AlertsResponse { alerts }))
}
