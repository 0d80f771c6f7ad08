//! Target manager - owns one collector per scrape target
//!
//! Stopping the manager signals every collector and waits until all of them
//! have exited, so no scrape batch can reach the sample queue afterwards.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::LabelSet;
use crate::config::TargetConfig;
use crate::lifecycle::Subsystem;
use crate::queue::SampleSender;

use super::collector::{CollectorHandle, ScrapeContext};
use super::messages::TargetHealth;

pub struct TargetManagerHandle {
    collectors: Vec<CollectorHandle>,
    shutdown_tx: watch::Sender<bool>,

    /// Yields `None` once every collector has dropped its `done` sender
    done_rx: Mutex<mpsc::Receiver<()>>,
}

impl TargetManagerHandle {
    /// Spawn a collector for every target
    pub fn spawn(
        targets: &[TargetConfig],
        global_labels: &LabelSet,
        concurrent_retrieval_allowance: usize,
        samples: SampleSender,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("metrics-hub/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (done_tx, done_rx) = mpsc::channel(1);

        let context = ScrapeContext {
            client,
            samples,
            permits: Arc::new(Semaphore::new(concurrent_retrieval_allowance.max(1))),
            global_labels: global_labels.clone(),
            shutdown_rx,
            done: done_tx,
        };

        let collectors = targets
            .iter()
            .map(|target| {
                debug!("starting collector for {} ({})", target.job, target.url);
                CollectorHandle::spawn(target.clone(), context.clone())
            })
            .collect::<Vec<_>>();

        info!("scraping {} targets", collectors.len());

        Ok(Self {
            collectors,
            shutdown_tx,
            done_rx: Mutex::new(done_rx),
        })
    }

    pub fn collectors(&self) -> &[CollectorHandle] {
        &self.collectors
    }

    /// Health of every target that still answers
    pub async fn targets(&self) -> Vec<TargetHealth> {
        join_all(self.collectors.iter().map(CollectorHandle::health))
            .await
            .into_iter()
            .filter_map(|health| match health {
                Ok(health) => Some(health),
                Err(e) => {
                    warn!("failed to query target health: {e:#}");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl Subsystem for TargetManagerHandle {
    fn name(&self) -> &'static str {
        "Target Manager"
    }

    #[instrument(skip(self), fields(targets = self.collectors.len()))]
    async fn stop(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);

        let mut done_rx = self.done_rx.lock().await;
        while done_rx.recv().await.is_some() {}

        debug!("all collectors stopped");
        Ok(())
    }
}
