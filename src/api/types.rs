//! API response types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::Sample;
use crate::actors::{ActiveAlert, RemoteStats, TargetHealth};
use crate::config::Config;
use crate::lifecycle::ShutdownState;
use crate::storage::StorageStats;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
pub struct BuildInfo {
    pub name: &'static str,
    pub version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    /// Batches currently buffered
    pub depth: usize,
    pub capacity: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub build: BuildInfo,
    pub birth: DateTime<Utc>,
    pub uptime_secs: i64,
    pub config: Config,
    pub flags: BTreeMap<String, String>,
    pub samples_queue: QueueStatus,
    pub shutdown_state: ShutdownState,
}

#[derive(Debug, Serialize)]
pub struct TargetsResponse {
    pub targets: Vec<TargetHealth>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub samples: Vec<Sample>,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub alerts: Vec<ActiveAlert>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub timestamp: String,
    pub storage: StorageStats,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteStats>,

    pub samples_queue: QueueStatus,
    pub targets: usize,
}
