//! Helper functions for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics_hub::config::{Config, StorageConfig, TargetConfig};
use metrics_hub::lifecycle::{RemoteQueueFull, RemoteSink, Subsystem};
use metrics_hub::storage::{SampleSink, StorageResult};
use metrics_hub::{LabelSet, Sample, SampleBatch};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Config for a self-contained hub: in-memory storage, no targets, API on an
/// ephemeral port, no grace period
pub fn test_config() -> Config {
    let mut config = Config {
        storage: StorageConfig::Memory {
            max_samples_per_series: 100,
        },
        samples_queue_capacity: 16,
        ..Default::default()
    };
    config.api.bind_addr = "127.0.0.1:0".parse().unwrap();
    config
}

pub fn target(job: &str, url: String) -> TargetConfig {
    TargetConfig {
        job: job.to_string(),
        url,
        interval: 3600,
        token: None,
        labels: LabelSet::new(),
    }
}

pub fn exposition(samples: &[(&str, f64)]) -> serde_json::Value {
    serde_json::Value::Array(
        samples
            .iter()
            .map(|(name, value)| serde_json::json!({ "name": name, "value": value }))
            .collect(),
    )
}

/// Serve a fixed exposition under `route`
pub async fn mount_target(server: &MockServer, route: &str, samples: &[(&str, f64)]) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(exposition(samples)))
        .mount(server)
        .await;
}

pub fn batch(values: &[f64]) -> SampleBatch {
    let now = Utc::now();
    SampleBatch::Samples(values.iter().map(|v| Sample::new("test_metric", *v, now)).collect())
}

/// Poll `condition` until it holds or `timeout` expires
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Ordered log of what the recording mocks observed
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("{event} never happened: {:?}", self.events()))
    }

    pub fn count(&self, event: &str) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

pub struct RecordingSubsystem {
    pub name: &'static str,
    pub log: EventLog,
}

#[async_trait]
impl Subsystem for RecordingSubsystem {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.log.push(format!("{}.stop", self.name));
        Ok(())
    }
}

/// Storage double that records appended values
#[derive(Default)]
pub struct RecordingSink {
    pub log: EventLog,
    pub appended: Mutex<Vec<Vec<f64>>>,
}

#[async_trait]
impl SampleSink for RecordingSink {
    async fn append(&self, samples: &[Sample]) -> StorageResult<()> {
        self.log.push("storage.append");
        self.appended
            .lock()
            .unwrap()
            .push(samples.iter().map(|s| s.value).collect());
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.log.push("storage.close");
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingRemote {
    pub log: EventLog,
    pub enqueued: Mutex<Vec<Vec<f64>>>,
}

#[async_trait]
impl RemoteSink for RecordingRemote {
    fn enqueue(&self, samples: Vec<Sample>) -> Result<(), RemoteQueueFull> {
        self.log.push("remote.enqueue");
        self.enqueued
            .lock()
            .unwrap()
            .push(samples.iter().map(|s| s.value).collect());
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.log.push("remote.close");
        Ok(())
    }
}
