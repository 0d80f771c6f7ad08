//! Lifecycle contracts the shutdown coordinator drives
//!
//! Handles are stopped at most once by the coordinator; they need not be
//! idempotent themselves.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::Sample;
use crate::storage::SampleSink;

/// A concurrently running subsystem that can be asked to stop
#[async_trait]
pub trait Subsystem: Send + Sync {
    /// Operator-facing name used in shutdown logs
    fn name(&self) -> &'static str;

    /// Request graceful termination
    ///
    /// Returning an error is logged by the coordinator; it never aborts the
    /// remaining shutdown steps.
    async fn stop(&self) -> anyhow::Result<()>;
}

#[async_trait]
impl<T: Subsystem + ?Sized> Subsystem for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn stop(&self) -> anyhow::Result<()> {
        (**self).stop().await
    }
}

/// Returned when the remote forwarder has no room for more samples
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQueueFull {
    /// Number of samples that were discarded
    pub discarded: usize,
}

impl fmt::Display for RemoteQueueFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote queue full, discarded {} samples",
            self.discarded
        )
    }
}

impl std::error::Error for RemoteQueueFull {}

/// Optional remote long-term storage, as seen by the fan-out loop
#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Non-blocking hand-off; buffering and retries belong to the implementation
    fn enqueue(&self, samples: Vec<Sample>) -> Result<(), RemoteQueueFull>;

    /// Stop accepting samples and flush what is buffered
    async fn close(&self) -> anyhow::Result<()>;
}

/// Everything the shutdown coordinator stops, in the order it stops them
pub struct Subsystems {
    /// Step 1: stops producing sample batches
    pub target_manager: Box<dyn Subsystem>,

    /// Step 2: stops scheduling evaluations
    pub rule_manager: Box<dyn Subsystem>,

    /// Step 5: background work on local storage, stopped right before it closes
    pub storage_tasks: Vec<Box<dyn Subsystem>>,

    /// Step 5: local storage
    pub storage: Arc<dyn SampleSink>,

    /// Step 6: optional remote forwarder
    pub remote: Option<Arc<dyn RemoteSink>>,

    /// Step 7: notification queue
    pub notifications: Box<dyn Subsystem>,
}
