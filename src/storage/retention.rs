//! Retention sweeper
//!
//! Periodically deletes samples older than the configured maximum age. It is
//! stopped as part of closing local storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, instrument};

use super::StorageBackend;
use crate::lifecycle::Subsystem;

#[derive(Debug)]
enum RetentionCommand {
    SweepNow {
        respond_to: oneshot::Sender<anyhow::Result<u64>>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

struct RetentionSweeper {
    storage: Arc<dyn StorageBackend>,
    interval: Duration,
    max_age: Duration,
    command_rx: mpsc::Receiver<RetentionCommand>,
}

impl RetentionSweeper {
    #[instrument(skip(self), fields(interval = ?self.interval, max_age = ?self.max_age))]
    async fn run(mut self) {
        debug!("starting retention sweeper");

        let mut ticker = time::interval(self.interval);
        // The first tick fires immediately; skip it so startup is not a sweep
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!("retention sweep failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RetentionCommand::SweepNow { respond_to } => {
                            let _ = respond_to.send(self.sweep().await);
                        }
                        RetentionCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            let _ = respond_to.send(());
                            break;
                        }
                    }
                }

                else => break,
            }
        }

        debug!("retention sweeper stopped");
    }

    async fn sweep(&self) -> anyhow::Result<u64> {
        let max_age = chrono::Duration::from_std(self.max_age)?;
        let cutoff = Utc::now() - max_age;

        let deleted = self.storage.delete_before(cutoff).await?;
        info!("retention sweep removed {deleted} samples older than {cutoff}");
        Ok(deleted)
    }
}

/// Handle for the retention sweeper task
#[derive(Clone)]
pub struct RetentionHandle {
    sender: mpsc::Sender<RetentionCommand>,
}

impl RetentionHandle {
    pub fn spawn(storage: Arc<dyn StorageBackend>, interval: Duration, max_age: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let sweeper = RetentionSweeper {
            storage,
            interval: interval.max(Duration::from_millis(1)),
            max_age,
            command_rx: cmd_rx,
        };

        tokio::spawn(sweeper.run());

        Self { sender: cmd_tx }
    }

    /// Run a sweep immediately and return the number of deleted samples
    pub async fn sweep_now(&self) -> anyhow::Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RetentionCommand::SweepNow { respond_to: tx })
            .await?;

        rx.await?
    }
}

#[async_trait]
impl Subsystem for RetentionHandle {
    fn name(&self) -> &'static str {
        "Retention Sweeper"
    }

    /// Stop the sweeper once any running sweep has finished
    async fn stop(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();

        // A closed channel means the sweeper is already gone
        if self
            .sender
            .send(RetentionCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        Ok(())
    }
}
