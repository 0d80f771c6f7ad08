//! Fan-out loop
//!
//! Runs in the foreground and moves every batch from the sample queue into
//! local storage and, when configured, the remote forwarder.
//!
//! ```text
//! SampleReceiver ──► Failed / empty ──► dropped
//!                └─► Samples ──► storage.append ──► remote.enqueue (non-blocking)
//! ```
//!
//! Append and remote enqueue are independent: one failing never undoes the
//! other. The loop ends once the queue has been closed and drained.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::SampleBatch;
use crate::lifecycle::RemoteSink;
use crate::queue::SampleReceiver;
use crate::storage::SampleSink;

/// Counters kept over the lifetime of the loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FanOutStats {
    pub batches_received: u64,
    pub batches_forwarded: u64,
    pub failed_batches_dropped: u64,
    pub empty_batches_dropped: u64,
    pub samples_appended: u64,
    pub append_failures: u64,
    pub remote_rejections: u64,
}

pub struct FanOut {
    storage: Arc<dyn SampleSink>,
    remote: Option<Arc<dyn RemoteSink>>,
    stats: FanOutStats,
}

impl FanOut {
    pub fn new(storage: Arc<dyn SampleSink>, remote: Option<Arc<dyn RemoteSink>>) -> Self {
        Self {
            storage,
            remote,
            stats: FanOutStats::default(),
        }
    }

    /// Consume the queue until it is closed and drained
    #[instrument(skip_all, fields(remote = self.remote.is_some()))]
    pub async fn run(mut self, mut samples: SampleReceiver) -> FanOutStats {
        debug!("starting fan-out loop");

        while let Some(batch) = samples.recv().await {
            self.stats.batches_received += 1;
            self.dispatch(batch).await;
        }

        info!(
            "fan-out loop finished: {} batches received, {} forwarded",
            self.stats.batches_received, self.stats.batches_forwarded
        );
        self.stats
    }

    async fn dispatch(&mut self, batch: SampleBatch) {
        let samples = match batch {
            SampleBatch::Failed(reason) => {
                trace!("dropping failed batch: {reason}");
                self.stats.failed_batches_dropped += 1;
                return;
            }
            SampleBatch::Samples(samples) if samples.is_empty() => {
                trace!("dropping empty batch");
                self.stats.empty_batches_dropped += 1;
                return;
            }
            SampleBatch::Samples(samples) => samples,
        };

        self.stats.batches_forwarded += 1;

        match self.storage.append(&samples).await {
            Ok(()) => self.stats.samples_appended += samples.len() as u64,
            Err(e) => {
                error!("failed to append {} samples to local storage: {e}", samples.len());
                self.stats.append_failures += 1;
            }
        }

        if let Some(remote) = &self.remote {
            if let Err(e) = remote.enqueue(samples) {
                warn!("{e}");
                self.stats.remote_rejections += 1;
            }
        }
    }
}
