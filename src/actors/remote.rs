//! Remote queue manager - forwards samples to long-term storage
//!
//! ```text
//! fan-out ──try_send──► [ queue_capacity batches ] ──► sender task ──POST──► OpenTSDB /api/put
//! ```
//!
//! The fan-out loop never waits on the remote side: when the buffer is full
//! the samples are discarded and counted. The sender task coalesces buffered
//! batches into requests of at most `max_samples_per_send` samples. Failed
//! requests are logged and dropped without retry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace};

use crate::config::RemoteConfig;
use crate::lifecycle::{RemoteQueueFull, RemoteSink};
use crate::{METRIC_NAME_LABEL, Sample};

/// One data point in OpenTSDB's `put` JSON format
#[derive(Debug, Serialize)]
struct OpenTsdbPoint<'a> {
    metric: &'a str,

    /// Unix seconds
    timestamp: i64,

    value: f64,
    tags: BTreeMap<&'a str, &'a str>,
}

impl<'a> From<&'a Sample> for OpenTsdbPoint<'a> {
    fn from(sample: &'a Sample) -> Self {
        let tags = sample
            .metric
            .iter()
            .filter(|(name, _)| name.as_str() != METRIC_NAME_LABEL)
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();

        Self {
            metric: sample.name(),
            timestamp: sample.timestamp.timestamp(),
            value: sample.value,
            tags,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Sample counters of the forwarder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStats {
    pub sent: u64,
    pub failed: u64,
    pub dropped: u64,
}

struct RemoteSender {
    client: Client,
    url: String,
    max_samples_per_send: usize,
    batch_rx: mpsc::Receiver<Vec<Sample>>,
    close_rx: watch::Receiver<bool>,
    counters: Arc<Counters>,
}

impl RemoteSender {
    #[instrument(skip(self), fields(url = %self.url))]
    async fn run(mut self) {
        debug!("starting remote sender");

        let mut closing = false;

        loop {
            let batch = if closing {
                self.batch_rx.recv().await
            } else {
                tokio::select! {
                    biased;

                    batch = self.batch_rx.recv() => batch,

                    _ = self.close_rx.changed() => {
                        // Stop intake; what is buffered still gets sent
                        self.batch_rx.close();
                        closing = true;
                        continue;
                    }
                }
            };

            let Some(mut pending) = batch else {
                break;
            };

            while pending.len() < self.max_samples_per_send {
                match self.batch_rx.try_recv() {
                    Ok(more) => pending.extend(more),
                    Err(_) => break,
                }
            }

            for chunk in pending.chunks(self.max_samples_per_send) {
                self.send(chunk).await;
            }
        }

        debug!("remote sender stopped");
    }

    async fn send(&self, samples: &[Sample]) {
        let points = samples.iter().map(OpenTsdbPoint::from).collect::<Vec<_>>();
        let count = samples.len() as u64;

        trace!("posting {count} samples");

        match self.client.post(&self.url).json(&points).send().await {
            Ok(response) if response.status().is_success() => {
                self.counters.sent.fetch_add(count, Ordering::Relaxed);
            }
            Ok(response) => {
                error!("remote storage rejected {count} samples with status: {}", response.status());
                self.counters.failed.fetch_add(count, Ordering::Relaxed);
            }
            Err(e) => {
                error!("failed to send {count} samples to remote storage: {}", e);
                self.counters.failed.fetch_add(count, Ordering::Relaxed);
            }
        }
    }
}

/// Handle of the remote forwarder
pub struct RemoteQueueManager {
    batch_tx: mpsc::Sender<Vec<Sample>>,
    close_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl RemoteQueueManager {
    pub fn spawn(config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        let (batch_tx, batch_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (close_tx, close_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let sender = RemoteSender {
            client,
            url: config.url.clone(),
            max_samples_per_send: config.max_samples_per_send.max(1),
            batch_rx,
            close_rx,
            counters: counters.clone(),
        };

        info!("forwarding samples to remote storage at {}", config.url);

        Ok(Self {
            batch_tx,
            close_tx,
            task: Mutex::new(Some(tokio::spawn(sender.run()))),
            counters,
        })
    }

    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl RemoteSink for RemoteQueueManager {
    fn enqueue(&self, samples: Vec<Sample>) -> Result<(), RemoteQueueFull> {
        self.batch_tx.try_send(samples).map_err(|e| {
            let discarded = match e {
                mpsc::error::TrySendError::Full(samples)
                | mpsc::error::TrySendError::Closed(samples) => samples.len(),
            };
            self.counters
                .dropped
                .fetch_add(discarded as u64, Ordering::Relaxed);
            RemoteQueueFull { discarded }
        })
    }

    async fn close(&self) -> Result<()> {
        self.close_tx.send_replace(true);

        if let Some(task) = self.task.lock().await.take() {
            task.await.context("remote sender panicked")?;
        }

        let stats = self.stats();
        debug!(
            "remote storage closed: {} sent, {} failed, {} dropped",
            stats.sent, stats.failed, stats.dropped
        );
        Ok(())
    }
}
