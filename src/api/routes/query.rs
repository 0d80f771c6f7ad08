//! Sample query endpoints
//!
//! Both endpoints take the metric name in `metric`; every other query
//! parameter is an equality matcher on a label.

use std::collections::BTreeMap;

use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{DateTime, Duration, Utc};

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::ApiState;
use crate::api::types::QueryResponse;
use crate::storage::Selector;

/// Default lookback of `query_range` without `start`
const DEFAULT_RANGE_SECS: i64 = 3600;

/// GET /api/v1/query?metric=<name>&<label>=<value>...
///
/// Latest sample of every matching series.
pub async fn query(
    State(state): State<ApiState>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> ApiResult<Json<QueryResponse>> {
    let selector = selector(&mut params)?;
    let samples = state.storage.query_latest(&selector).await?;

    Ok(Json(QueryResponse { samples }))
}

/// GET /api/v1/query_range?metric=<name>&start=<rfc3339>&end=<rfc3339>&<label>=<value>...
///
/// `end` defaults to now and `start` to one hour before `end`.
pub async fn query_range(
    State(state): State<ApiState>,
    Query(mut params): Query<BTreeMap<String, String>>,
) -> ApiResult<Json<QueryResponse>> {
    let end = match params.remove("end") {
        Some(end) => parse_time("end", &end)?,
        None => Utc::now(),
    };
    let start = match params.remove("start") {
        Some(start) => parse_time("start", &start)?,
        None => end - Duration::seconds(DEFAULT_RANGE_SECS),
    };

    if start > end {
        return Err(ApiError::InvalidRequest("start must not be after end".to_string()));
    }

    let selector = selector(&mut params)?;
    let samples = state.storage.query_range(&selector, start, end).await?;

    Ok(Json(QueryResponse { samples }))
}

fn selector(params: &mut BTreeMap<String, String>) -> ApiResult<Selector> {
    let metric = params
        .remove("metric")
        .filter(|metric| !metric.is_empty())
        .ok_or_else(|| ApiError::InvalidRequest("missing parameter: metric".to_string()))?;

    Ok(Selector {
        metric,
        matchers: std::mem::take(params),
    })
}

fn parse_time(name: &str, value: &str) -> ApiResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| ApiError::InvalidRequest(format!("invalid {name}: {e}")))
}
