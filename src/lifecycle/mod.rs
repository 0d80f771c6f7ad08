//! Process lifecycle and shutdown coordination
//!
//! ## State Machine
//!
//! ```text
//! Running ──first trigger──► ShuttingDown ──sequence complete──► Stopped
//! ```
//!
//! Triggers (OS signal, web quit request) are producers into one bounded
//! channel. A single coordinator task receives the first trigger, runs the
//! shutdown sequence and consumes itself in the process, so the sequence can
//! only ever execute once. Later triggers find the channel full or closed and
//! are absorbed.
//!
//! ## Shutdown Sequence
//!
//! 1. Stop the target manager (no new scrape batches)
//! 2. Stop the rule manager (no new evaluations)
//! 3. Grace period for in-flight work
//! 4. Close the sample queue and wait for the fan-out loop to drain it
//! 5. Close local storage (after its background tasks)
//! 6. Close the remote forwarder, if configured
//! 7. Close the notification queue
//! 8. Publish `Stopped`
//!
//! A step that fails, or does not finish within the step timeout, is logged
//! and the sequence moves on.

pub mod signals;
pub mod subsystem;

use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, instrument, warn};

pub use signals::spawn_signal_listener;
pub use subsystem::{RemoteQueueFull, RemoteSink, Subsystem, Subsystems};

use crate::config::GracePolicy;
use crate::queue::QueueCloser;

/// How often the drain policy checks the sample queue
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long a single step may take before it is abandoned
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Stopped,
}

/// What started the shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownTrigger {
    /// SIGINT
    Interrupt,

    /// SIGTERM
    Terminate,

    /// Explicit quit request from the web API
    Quit,

    /// The web server stopped serving unexpectedly
    ServeError,

    /// Every trigger handle was dropped without firing
    Detached,
}

impl fmt::Display for ShutdownTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownTrigger::Interrupt => write!(f, "SIGINT"),
            ShutdownTrigger::Terminate => write!(f, "SIGTERM"),
            ShutdownTrigger::Quit => write!(f, "quit request"),
            ShutdownTrigger::ServeError => write!(f, "web server failure"),
            ShutdownTrigger::Detached => write!(f, "detached trigger handles"),
        }
    }
}

/// Outcome of a completed shutdown sequence
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub trigger: ShutdownTrigger,
    pub elapsed: Duration,

    /// Names of the steps whose stop/close reported an error or timed out
    pub failed_steps: Vec<&'static str>,
}

/// Cloneable trigger side of the shutdown gate
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    trigger_tx: mpsc::Sender<ShutdownTrigger>,
    state_rx: watch::Receiver<ShutdownState>,
}

impl ShutdownHandle {
    /// Request shutdown without waiting for it
    ///
    /// Only the first trigger has an effect; everything after it is a no-op.
    pub fn trigger(&self, trigger: ShutdownTrigger) {
        if self.state() != ShutdownState::Running {
            debug!("ignoring {trigger}: shutdown already underway");
            return;
        }

        // Full or closed both mean another trigger already won
        if self.trigger_tx.try_send(trigger).is_err() {
            debug!("ignoring {trigger}: shutdown already requested");
        }
    }

    /// Request shutdown and wait until the sequence has completed
    pub async fn shutdown(&self, trigger: ShutdownTrigger) {
        self.trigger(trigger);
        self.wait_stopped().await;
    }

    pub fn state(&self) -> ShutdownState {
        *self.state_rx.borrow()
    }

    /// Wait until the shutdown sequence has completed
    pub async fn wait_stopped(&self) {
        let mut state_rx = self.state_rx.clone();
        // An error means the coordinator is gone, nothing left to wait for
        let _ = state_rx
            .wait_for(|state| *state == ShutdownState::Stopped)
            .await;
    }
}

/// Owns every subsystem handle and runs the shutdown sequence exactly once
pub struct ShutdownCoordinator {
    subsystems: Subsystems,
    queue: QueueCloser,
    grace_period: Duration,
    grace_policy: GracePolicy,
    step_timeout: Duration,
    trigger_rx: mpsc::Receiver<ShutdownTrigger>,
    state_tx: watch::Sender<ShutdownState>,
}

impl ShutdownCoordinator {
    pub fn new(
        subsystems: Subsystems,
        queue: QueueCloser,
        grace_period: Duration,
        grace_policy: GracePolicy,
    ) -> (Self, ShutdownHandle) {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(ShutdownState::Running);

        let coordinator = Self {
            subsystems,
            queue,
            grace_period,
            grace_policy,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            trigger_rx,
            state_tx,
        };

        let handle = ShutdownHandle {
            trigger_tx,
            state_rx,
        };

        (coordinator, handle)
    }

    /// Bound every stop/close step by `limit` instead of the default
    pub fn with_step_timeout(mut self, limit: Duration) -> Self {
        self.step_timeout = limit;
        self
    }

    /// Wait for the first trigger, then shut everything down
    pub async fn run(mut self) -> ShutdownReport {
        debug!("shutdown coordinator waiting for a trigger");

        let trigger = self
            .trigger_rx
            .recv()
            .await
            .unwrap_or(ShutdownTrigger::Detached);

        self.shutdown(trigger).await
    }

    /// Run the shutdown sequence now
    #[instrument(skip(self))]
    pub async fn shutdown(self, trigger: ShutdownTrigger) -> ShutdownReport {
        let Self {
            subsystems,
            queue,
            grace_period,
            grace_policy,
            step_timeout,
            trigger_rx,
            state_tx,
        } = self;

        // Later triggers now fail to send and are absorbed
        drop(trigger_rx);
        state_tx.send_replace(ShutdownState::ShuttingDown);

        let started = Instant::now();
        let mut failed_steps = vec![];

        info!("shutdown has been requested ({trigger}); subsystems are closing:");

        let mut step = Step {
            limit: step_timeout,
            failed: &mut failed_steps,
        };

        step.stop(subsystems.target_manager.as_ref()).await;
        step.stop(subsystems.rule_manager.as_ref()).await;

        info!(
            "waiting {:?} for background systems to exit and flush before finalizing (DO NOT INTERRUPT THE PROCESS) ...",
            grace_period
        );
        wait_grace_period(&queue, grace_period, grace_policy).await;

        // A consumer stuck in storage keeps the queue; it is abandoned on timeout
        step.run("Sample Queue", async move {
            queue.close().await;
            Ok::<(), Infallible>(())
        })
        .await;

        for task in &subsystems.storage_tasks {
            step.stop(task.as_ref()).await;
        }
        step.run("Local Storage", subsystems.storage.close()).await;

        if let Some(remote) = &subsystems.remote {
            step.run("Remote Storage", remote.close()).await;
        }

        step.stop(subsystems.notifications.as_ref()).await;

        state_tx.send_replace(ShutdownState::Stopped);
        info!("see you next time!");

        ShutdownReport {
            trigger,
            elapsed: started.elapsed(),
            failed_steps,
        }
    }
}

/// Runs one shutdown step at a time and records the ones that did not finish
struct Step<'a> {
    limit: Duration,
    failed: &'a mut Vec<&'static str>,
}

impl Step<'_> {
    async fn stop(&mut self, subsystem: &dyn Subsystem) {
        self.run(subsystem.name(), subsystem.stop()).await;
    }

    async fn run<F, E>(&mut self, name: &'static str, step: F)
    where
        F: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        match time::timeout(self.limit, step).await {
            Ok(Ok(())) => info!("{name}: done"),
            Ok(Err(e)) => {
                warn!("{name}: failed to stop: {e:#}");
                self.failed.push(name);
            }
            Err(_) => {
                warn!("{name}: did not finish within {:?}, moving on", self.limit);
                self.failed.push(name);
            }
        }
    }
}

async fn wait_grace_period(queue: &QueueCloser, grace_period: Duration, policy: GracePolicy) {
    match policy {
        GracePolicy::Fixed => time::sleep(grace_period).await,
        GracePolicy::Drain => {
            let drained = async {
                while !queue.is_empty() {
                    time::sleep(DRAIN_POLL_INTERVAL).await;
                }
            };
            if time::timeout(grace_period, drained).await.is_err() {
                debug!("grace period elapsed with {} batches still queued", queue.len());
            }
        }
    }
}
