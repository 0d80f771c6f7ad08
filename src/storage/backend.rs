//! Storage trait definitions
//!
//! `SampleSink` is the narrow write/close contract the fan-out loop and the
//! shutdown coordinator rely on. `StorageBackend` extends it with the read
//! side used by the rule manager and the API.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::StorageResult;
use crate::{LabelSet, METRIC_NAME_LABEL, Sample};

/// Equality selector over series
///
/// Matches every series with the given metric name whose labels include all
/// `matchers` pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct Selector {
    pub metric: String,

    #[serde(default)]
    pub matchers: BTreeMap<String, String>,
}

impl Selector {
    pub fn metric(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            matchers: BTreeMap::new(),
        }
    }

    pub fn with_matcher(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matchers.insert(name.into(), value.into());
        self
    }

    pub fn matches(&self, metric: &LabelSet) -> bool {
        metric.get(METRIC_NAME_LABEL).map(String::as_str) == Some(self.metric.as_str())
            && self
                .matchers
                .iter()
                .all(|(name, value)| metric.get(name) == Some(value))
    }
}

/// Health status of the storage backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Storage statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    pub backend: &'static str,
    pub total_samples: u64,
    pub total_series: u64,
    pub oldest_sample: Option<DateTime<Utc>>,
    pub newest_sample: Option<DateTime<Utc>>,
}

/// Write side of local storage, as seen by the fan-out loop
#[async_trait]
pub trait SampleSink: Send + Sync {
    /// Append samples; called synchronously from the fan-out loop
    async fn append(&self, samples: &[Sample]) -> StorageResult<()>;

    /// Flush and release resources; later appends fail with `StorageError::Closed`
    async fn close(&self) -> StorageResult<()>;
}

/// Full storage backend
///
/// Implementations must be `Send + Sync` as they are shared between the
/// fan-out loop, the rule manager, the retention sweeper and API handlers.
#[async_trait]
pub trait StorageBackend: SampleSink {
    /// Most recent sample of every series matching the selector
    async fn query_latest(&self, selector: &Selector) -> StorageResult<Vec<Sample>>;

    /// Samples of matching series within `[start, end]`, oldest first
    async fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Sample>>;

    /// Label sets of all known series
    async fn series(&self) -> StorageResult<Vec<LabelSet>>;

    /// Delete samples older than `before`, returning how many were removed
    async fn delete_before(&self, before: DateTime<Utc>) -> StorageResult<u64>;

    async fn stats(&self) -> StorageResult<StorageStats>;

    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Narrow a shared backend to its write side
    fn into_sink(self: Arc<Self>) -> Arc<dyn SampleSink>;
}
