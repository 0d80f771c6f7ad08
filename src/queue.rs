//! Bounded sample queue
//!
//! The single hand-off point between sample producers (target collectors,
//! recording rules) and the fan-out loop.
//!
//! ```text
//! SampleSender (clone per producer) ──► [ capacity C ] ──► SampleReceiver (fan-out loop)
//!                                            ▲
//!                       QueueCloser ─────────┘ (shutdown coordinator only)
//! ```
//!
//! `enqueue` waits while the queue is full, it never drops. Closing is an
//! explicit capability held by exactly one owner: `QueueCloser::close` consumes
//! the closer, so a double close cannot be expressed. Batches buffered at close
//! time are still handed to the receiver before it reports closure.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace};

use crate::SampleBatch;

/// Errors returned when a batch cannot be enqueued
///
/// The rejected batch is handed back so it is never lost silently.
#[derive(Debug)]
pub enum QueueError {
    /// The queue has been closed; enqueuing now is a contract violation
    Closed(SampleBatch),

    /// The queue is at capacity (only returned by `try_enqueue`)
    Full(SampleBatch),
}

impl QueueError {
    pub fn into_batch(self) -> SampleBatch {
        match self {
            QueueError::Closed(batch) | QueueError::Full(batch) => batch,
        }
    }
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Closed(_) => write!(f, "sample queue is closed"),
            QueueError::Full(_) => write!(f, "sample queue is full"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Create a bounded sample queue with a fixed capacity
///
/// A capacity of zero is raised to one; configuration validation rejects it
/// before it gets here.
pub fn bounded(capacity: usize) -> (SampleSender, SampleReceiver, QueueCloser) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let (close_tx, close_rx) = watch::channel(false);
    let (released_tx, released_rx) = oneshot::channel();
    let depth = Arc::new(AtomicUsize::new(0));

    debug!("created sample queue with capacity {capacity}");

    let closer = QueueCloser {
        close_tx,
        released_rx,
        observer: QueueObserver {
            depth: depth.clone(),
            capacity,
        },
    };

    let receiver = SampleReceiver {
        rx,
        close_rx,
        closing: false,
        depth: depth.clone(),
        _released: released_tx,
    };

    (SampleSender { tx, depth }, receiver, closer)
}

/// Producer side of the queue
#[derive(Clone, Debug)]
pub struct SampleSender {
    tx: mpsc::Sender<SampleBatch>,
    depth: Arc<AtomicUsize>,
}

impl SampleSender {
    /// Enqueue a batch, waiting for a free slot if the queue is full
    pub async fn enqueue(&self, batch: SampleBatch) -> Result<(), QueueError> {
        match self.tx.reserve().await {
            Ok(permit) => {
                // Counted before the batch becomes visible to the receiver
                self.depth.fetch_add(1, Ordering::AcqRel);
                permit.send(batch);
                Ok(())
            }
            Err(_) => Err(QueueError::Closed(batch)),
        }
    }

    /// Enqueue without waiting
    pub fn try_enqueue(&self, batch: SampleBatch) -> Result<(), QueueError> {
        match self.tx.try_reserve() {
            Ok(permit) => {
                self.depth.fetch_add(1, Ordering::AcqRel);
                permit.send(batch);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(())) => Err(QueueError::Full(batch)),
            Err(mpsc::error::TrySendError::Closed(())) => Err(QueueError::Closed(batch)),
        }
    }

    /// Number of batches currently buffered
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of the queue, owned by the fan-out loop
#[derive(Debug)]
pub struct SampleReceiver {
    rx: mpsc::Receiver<SampleBatch>,
    close_rx: watch::Receiver<bool>,
    closing: bool,
    depth: Arc<AtomicUsize>,

    /// Dropped together with the receiver; tells the closer the queue is released
    _released: oneshot::Sender<()>,
}

impl SampleReceiver {
    /// Receive the next batch in FIFO order
    ///
    /// Returns `None` once the queue has been closed and fully drained, or
    /// once every sender is gone.
    pub async fn recv(&mut self) -> Option<SampleBatch> {
        let batch = self.next_batch().await;
        if batch.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        batch
    }

    async fn next_batch(&mut self) -> Option<SampleBatch> {
        let Self {
            rx,
            close_rx,
            closing,
            ..
        } = self;

        if !*closing {
            tokio::select! {
                biased;

                batch = rx.recv() => return batch,

                closed = async { close_rx.wait_for(|closed| *closed).await.is_ok() } => {
                    // An explicit close stops new sends but keeps what is buffered.
                    // A dropped closer leaves termination to the senders.
                    if closed {
                        trace!("sample queue closed, draining {} buffered batches", rx.len());
                        rx.close();
                    }
                    *closing = true;
                }
            }
        }

        rx.recv().await
    }
}

/// Close capability for the queue
///
/// Not cloneable; `close` consumes it.
#[derive(Debug)]
pub struct QueueCloser {
    close_tx: watch::Sender<bool>,
    released_rx: oneshot::Receiver<()>,
    observer: QueueObserver,
}

impl QueueCloser {
    /// Number of batches currently buffered
    pub fn len(&self) -> usize {
        self.observer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observer.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.observer.capacity()
    }

    /// Read-only view of the queue depth
    pub fn observer(&self) -> QueueObserver {
        self.observer.clone()
    }

    /// Close the queue and wait until the consumer has drained and released it
    ///
    /// Must only be called after every producer has stopped.
    pub async fn close(self) {
        debug!("closing sample queue ({} batches buffered)", self.len());
        self.close_tx.send_replace(true);

        // Resolves with an error once the receiver is dropped, which is the signal.
        let _ = self.released_rx.await;
        debug!("sample queue released by consumer");
    }
}

/// Reports queue depth without being able to send or keep the queue open
///
/// The depth stays accurate after every producer is gone, which is what the
/// drain policy waits on.
#[derive(Debug, Clone)]
pub struct QueueObserver {
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl QueueObserver {
    /// Number of batches currently buffered
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
