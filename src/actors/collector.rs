//! TargetCollector - scrapes a single target
//!
//! Each configured target gets its own collector actor. Scrapes from all
//! collectors share one semaphore so that only a bounded number of requests
//! are in flight at once.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → acquire permit → GET target → decode exposition → merge labels → enqueue batch
//!     ↑
//!     └─── Commands (PollNow, GetHealth), shutdown signal
//! ```
//!
//! Every scrape ends in the sample queue: the decoded samples plus a synthetic
//! `up` sample on success, a `Failed` batch followed by `up 0` otherwise.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Semaphore, mpsc, oneshot, watch};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, instrument, trace, warn};

use crate::config::TargetConfig;
use crate::queue::SampleSender;
use crate::util::merge_labels;
use crate::{BatchError, LabelSet, METRIC_NAME_LABEL, Sample, SampleBatch};

use super::messages::{CollectorCommand, Health, TargetHealth};

/// One entry of a target's JSON exposition
#[derive(Debug, Deserialize)]
struct ExposedSample {
    name: String,

    #[serde(default)]
    labels: LabelSet,

    value: f64,

    /// Scrape time is used when absent
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

/// Resources shared by every collector of a target manager
#[derive(Clone)]
pub struct ScrapeContext {
    pub client: reqwest::Client,
    pub samples: SampleSender,
    pub permits: Arc<Semaphore>,
    pub global_labels: LabelSet,
    pub shutdown_rx: watch::Receiver<bool>,

    /// Held for as long as the collector runs
    pub done: mpsc::Sender<()>,
}

/// Actor that scrapes a single target
pub struct TargetCollector {
    config: TargetConfig,

    /// `job`, `instance` and the configured target labels
    target_labels: LabelSet,

    context: ScrapeContext,
    command_rx: mpsc::Receiver<CollectorCommand>,
    health: TargetHealth,
}

impl TargetCollector {
    pub fn new(
        config: TargetConfig,
        command_rx: mpsc::Receiver<CollectorCommand>,
        context: ScrapeContext,
    ) -> Self {
        let mut target_labels = config.labels.clone();
        target_labels.insert("job".to_string(), config.job.clone());
        target_labels.insert("instance".to_string(), instance_of(&config.url));

        let health = TargetHealth {
            job: config.job.clone(),
            url: config.url.clone(),
            labels: target_labels.clone(),
            health: Health::Unknown,
            last_scrape: None,
            last_scrape_duration_ms: None,
            last_error: None,
            samples_scraped: 0,
        };

        Self {
            config,
            target_labels,
            context,
            command_rx,
            health,
        }
    }

    /// Run the actor's main loop
    ///
    /// Runs until the shutdown signal fires or every handle is dropped. A scrape
    /// that is still in flight when the signal fires is abandoned, whether the
    /// interval or a `PollNow` started it.
    #[instrument(skip(self), fields(job = %self.config.job, url = %self.config.url))]
    pub async fn run(mut self) {
        debug!("starting target collector");

        let mut shutdown_rx = self.context.shutdown_rx.clone();
        let mut ticker = interval(Duration::from_secs(self.config.interval));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,

                _ = ticker.tick() => {
                    tokio::select! {
                        result = self.poll() => {
                            if let Err(e) = result {
                                warn!("scrape failed: {:#}", e);
                            }
                        }
                        _ = shutdown_rx.changed() => {
                            debug!("abandoning in-flight scrape");
                            break;
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        CollectorCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            tokio::select! {
                                result = self.poll() => {
                                    let _ = respond_to.send(result);
                                }
                                _ = shutdown_rx.changed() => {
                                    debug!("abandoning in-flight scrape");
                                    let _ = respond_to.send(Err(anyhow!("collector stopped during scrape")));
                                    break;
                                }
                            }
                        }

                        CollectorCommand::GetHealth { respond_to } => {
                            let _ = respond_to.send(self.health.clone());
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("target collector stopped");
    }

    /// Scrape once and enqueue the result
    async fn poll(&mut self) -> Result<usize> {
        let _permit = self
            .context
            .permits
            .clone()
            .acquire_owned()
            .await
            .context("retrieval semaphore closed")?;

        let scraped_at = Utc::now();
        let started = Instant::now();
        let result = self.fetch().await;

        self.health.last_scrape = Some(scraped_at);
        self.health.last_scrape_duration_ms = Some(started.elapsed().as_millis() as u64);

        match result {
            Ok(exposed) => {
                let mut samples = self.to_samples(exposed, scraped_at);
                let scraped = samples.len();
                samples.push(self.up_sample(1.0, scraped_at));

                self.health.health = Health::Up;
                self.health.last_error = None;
                self.health.samples_scraped = scraped;

                trace!("scraped {scraped} samples");
                self.enqueue(SampleBatch::Samples(samples)).await?;
                Ok(scraped)
            }
            Err(reason) => {
                self.health.health = Health::Down;
                self.health.last_error = Some(reason.to_string());
                self.health.samples_scraped = 0;

                self.enqueue(SampleBatch::Failed(reason.clone())).await?;
                self.enqueue(SampleBatch::Samples(vec![self.up_sample(0.0, scraped_at)]))
                    .await?;
                Err(reason.into())
            }
        }
    }

    async fn fetch(&self) -> Result<Vec<ExposedSample>, BatchError> {
        let mut request = self.context.client.get(&self.config.url);

        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .timeout(Duration::from_secs(self.config.interval))
            .send()
            .await
            .map_err(|e| BatchError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BatchError::HttpStatus(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| BatchError::Unreachable(e.to_string()))?;

        serde_json::from_str(&body).map_err(|e| BatchError::Decode(e.to_string()))
    }

    fn to_samples(&self, exposed: Vec<ExposedSample>, scraped_at: DateTime<Utc>) -> Vec<Sample> {
        exposed
            .into_iter()
            .map(|exposed| {
                let mut metric = exposed.labels;
                metric.insert(METRIC_NAME_LABEL.to_string(), exposed.name);
                self.relabel(&mut metric);

                Sample {
                    metric,
                    value: exposed.value,
                    timestamp: exposed.timestamp.unwrap_or(scraped_at),
                }
            })
            .collect()
    }

    fn up_sample(&self, value: f64, scraped_at: DateTime<Utc>) -> Sample {
        let mut sample = Sample::new("up", value, scraped_at);
        self.relabel(&mut sample.metric);
        sample
    }

    fn relabel(&self, metric: &mut LabelSet) {
        merge_labels(metric, &self.target_labels);
        merge_labels(metric, &self.context.global_labels);
    }

    async fn enqueue(&self, batch: SampleBatch) -> Result<()> {
        if let Err(e) = self.context.samples.enqueue(batch).await {
            error!("{e}; dropping batch from {}", self.config.job);
            return Err(e.into());
        }
        Ok(())
    }
}

/// `host:port` of a target URL
fn instance_of(url: &str) -> String {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match (parsed.host_str(), parsed.port_or_known_default()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            _ => url.to_string(),
        },
        Err(_) => url.to_string(),
    }
}

/// Handle for controlling a TargetCollector
#[derive(Clone)]
pub struct CollectorHandle {
    sender: mpsc::Sender<CollectorCommand>,
    pub job: String,
    pub url: String,
}

impl CollectorHandle {
    /// Spawn a new collector actor
    pub fn spawn(config: TargetConfig, context: ScrapeContext) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let job = config.job.clone();
        let url = config.url.clone();

        let actor = TargetCollector::new(config, cmd_rx, context);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            job,
            url,
        }
    }

    /// Scrape immediately and return the number of samples scraped
    pub async fn poll_now(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn health(&self) -> Result<TargetHealth> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CollectorCommand::GetHealth { respond_to: tx })
            .await
            .context("failed to send GetHealth command")?;

        rx.await.context("failed to receive response")
    }
}
