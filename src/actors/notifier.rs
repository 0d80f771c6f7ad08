//! Notification handler - delivers alert notifications to an Alertmanager
//!
//! Notifications are produced by the rule manager into a bounded queue. The
//! handler posts them in batches to `{alertmanager_url}/api/v1/alerts`.
//! Without an Alertmanager they are logged and dropped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace};

use crate::lifecycle::Subsystem;

use super::messages::Notification;

/// Upper bound of notifications posted in one request
const MAX_BATCH_SIZE: usize = 64;

struct NotificationHandler {
    client: Client,
    endpoint: Option<String>,
    notification_rx: mpsc::Receiver<Notification>,
}

impl NotificationHandler {
    /// Deliver notifications until every sender is gone and the queue is drained
    #[instrument(skip(self), fields(endpoint = ?self.endpoint))]
    async fn run(mut self) {
        debug!("starting notification handler");

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        while self
            .notification_rx
            .recv_many(&mut batch, MAX_BATCH_SIZE)
            .await
            > 0
        {
            self.deliver(&batch).await;
            batch.clear();
        }

        debug!("notification handler stopped");
    }

    async fn deliver(&self, batch: &[Notification]) {
        let Some(endpoint) = &self.endpoint else {
            for notification in batch {
                debug!("no alertmanager configured, dropping notification {:?}", notification.labels);
            }
            return;
        };

        trace!("posting {} notifications", batch.len());

        match self.client.post(endpoint).json(batch).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("sent {} notifications to alertmanager", batch.len());
                } else {
                    error!("alertmanager rejected notifications with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("failed to send notifications: {}", e);
            }
        }
    }
}

/// Owner of the notification queue
pub struct NotifierHandle {
    sender: Mutex<Option<mpsc::Sender<Notification>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NotifierHandle {
    pub fn spawn(alertmanager_url: Option<&str>, capacity: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        let endpoint = alertmanager_url
            .map(|url| format!("{}/api/v1/alerts", url.trim_end_matches('/')));
        if endpoint.is_none() {
            info!("no alertmanager configured; alert notifications will only be logged");
        }

        let (notification_tx, notification_rx) = mpsc::channel(capacity.max(1));
        let handler = NotificationHandler {
            client,
            endpoint,
            notification_rx,
        };

        Ok(Self {
            sender: Mutex::new(Some(notification_tx)),
            task: Mutex::new(Some(tokio::spawn(handler.run()))),
        })
    }

    /// A producer side for the rule manager; `None` once the queue is closed
    pub async fn sender(&self) -> Option<mpsc::Sender<Notification>> {
        self.sender.lock().await.clone()
    }
}

#[async_trait]
impl Subsystem for NotifierHandle {
    fn name(&self) -> &'static str {
        "Notification Queue"
    }

    /// Close the queue and wait until everything buffered has been delivered
    ///
    /// Producers must have been stopped before, otherwise this waits for them.
    async fn stop(&self) -> Result<()> {
        drop(self.sender.lock().await.take());

        if let Some(task) = self.task.lock().await.take() {
            task.await.context("notification handler panicked")?;
        }
        Ok(())
    }
}
