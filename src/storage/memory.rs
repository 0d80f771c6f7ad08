//! In-memory storage backend (no persistence)
//!
//! Keeps a bounded ring buffer of samples per series. Useful for tests and
//! for deployments that only need recent data.
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Limited capacity**: Oldest samples of a series are evicted once its buffer is full

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::backend::{HealthStatus, SampleSink, Selector, StorageBackend, StorageStats};
use super::error::{StorageError, StorageResult};
use crate::{LabelSet, Sample};

/// Default maximum samples kept per series
pub const DEFAULT_MAX_SAMPLES_PER_SERIES: usize = 1000;

#[derive(Debug)]
struct Series {
    metric: LabelSet,
    points: VecDeque<(DateTime<Utc>, f64)>,
}

impl Series {
    fn sample(&self, (timestamp, value): (DateTime<Utc>, f64)) -> Sample {
        Sample {
            metric: self.metric.clone(),
            value,
            timestamp,
        }
    }
}

/// In-memory storage backend
pub struct MemoryBackend {
    series: RwLock<HashMap<String, Series>>,
    max_samples_per_series: usize,
    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SAMPLES_PER_SERIES)
    }

    pub fn with_capacity(max_samples_per_series: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_samples_per_series: max_samples_per_series.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SampleSink for MemoryBackend {
    async fn append(&self, samples: &[Sample]) -> StorageResult<()> {
        self.ensure_open()?;
        trace!("appending {} samples to memory", samples.len());

        let mut series = self.series.write().await;
        for sample in samples {
            let entry = series
                .entry(sample.series_id())
                .or_insert_with(|| Series {
                    metric: sample.metric.clone(),
                    points: VecDeque::new(),
                });

            // Keep points ordered; out-of-order samples are inserted in place
            let position = entry
                .points
                .iter()
                .rposition(|(ts, _)| *ts <= sample.timestamp)
                .map_or(0, |p| p + 1);
            entry
                .points
                .insert(position, (sample.timestamp, sample.value));

            if entry.points.len() > self.max_samples_per_series {
                entry.points.pop_front();
            }
        }

        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend");
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn query_latest(&self, selector: &Selector) -> StorageResult<Vec<Sample>> {
        self.ensure_open()?;
        let series = self.series.read().await;

        let mut samples: Vec<Sample> = series
            .values()
            .filter(|s| selector.matches(&s.metric))
            .filter_map(|s| s.points.back().map(|point| s.sample(*point)))
            .collect();
        samples.sort_by(|a, b| a.metric.cmp(&b.metric));

        Ok(samples)
    }

    async fn query_range(
        &self,
        selector: &Selector,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Sample>> {
        self.ensure_open()?;
        let series = self.series.read().await;

        let mut samples: Vec<Sample> = series
            .values()
            .filter(|s| selector.matches(&s.metric))
            .flat_map(|s| {
                s.points
                    .iter()
                    .filter(|(ts, _)| *ts >= start && *ts <= end)
                    .map(|point| s.sample(*point))
            })
            .collect();
        samples.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.metric.cmp(&b.metric)));

        Ok(samples)
    }

    async fn series(&self) -> StorageResult<Vec<LabelSet>> {
        self.ensure_open()?;
        let series = self.series.read().await;

        let mut labels: Vec<LabelSet> = series.values().map(|s| s.metric.clone()).collect();
        labels.sort();
        Ok(labels)
    }

    async fn delete_before(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        self.ensure_open()?;
        let mut series = self.series.write().await;

        let mut deleted = 0u64;
        for s in series.values_mut() {
            while s.points.front().is_some_and(|(ts, _)| *ts < before) {
                s.points.pop_front();
                deleted += 1;
            }
        }
        series.retain(|_, s| !s.points.is_empty());

        debug!("deleted {deleted} samples older than {before}");
        Ok(deleted)
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let series = self.series.read().await;

        Ok(StorageStats {
            backend: "memory",
            total_samples: series.values().map(|s| s.points.len() as u64).sum(),
            total_series: series.len() as u64,
            oldest_sample: series
                .values()
                .filter_map(|s| s.points.front().map(|(ts, _)| *ts))
                .min(),
            newest_sample: series
                .values()
                .filter_map(|s| s.points.back().map(|(ts, _)| *ts))
                .max(),
        })
    }

    fn into_sink(self: Arc<Self>) -> Arc<dyn SampleSink> {
        self
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let closed = self.closed.load(Ordering::Acquire);

        Ok(HealthStatus {
            healthy: !closed,
            message: if closed {
                "In-memory storage closed".to_string()
            } else {
                "In-memory storage operational".to_string()
            },
            metadata: HashMap::from([("backend".to_string(), "memory".to_string())]),
        })
    }
}
