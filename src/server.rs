//! Startup wiring
//!
//! Local storage and the API listener are opened before any task is spawned.
//! The remote forwarder and notifier tasks start before later steps that can
//! still fail (building HTTP clients). On such a failure their handles are
//! dropped, which closes their channels and lets both tasks exit.
//!
//! ```text
//! open storage → bind API → create queue → spawn remote, notifier, rules, targets, retention
//!              → spawn shutdown coordinator → serve API → run fan-out loop (foreground)
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::actors::{
    NotifierHandle, RemoteQueueManager, RuleContext, RuleManagerHandle, TargetManagerHandle,
};
use crate::config::Config;
use crate::fanout::{FanOut, FanOutStats};
use crate::lifecycle::{
    RemoteSink, ShutdownCoordinator, ShutdownHandle, ShutdownReport, Subsystem, Subsystems,
};
use crate::queue::{self, SampleReceiver};
use crate::storage::{self, StorageBackend, retention::RetentionHandle};

/// Outcome of a server run
#[derive(Debug)]
pub struct ServeReport {
    /// `None` when the fan-out loop was still stuck after shutdown completed
    pub fan_out: Option<FanOutStats>,
    pub shutdown: ShutdownReport,
}

/// A fully started hub whose fan-out loop has not run yet
pub struct Server {
    fan_out: FanOut,
    samples: SampleReceiver,
    coordinator: JoinHandle<ShutdownReport>,
    shutdown: ShutdownHandle,
    storage: Arc<dyn StorageBackend>,
    targets: Arc<TargetManagerHandle>,
    rules: RuleManagerHandle,
    api_addr: Option<SocketAddr>,
}

impl Server {
    /// Start every subsystem
    ///
    /// `flags` are the command line flags as given, reported by the status API.
    pub async fn start(config: Config, flags: BTreeMap<String, String>) -> Result<Self> {
        let birth = Utc::now();

        let storage = storage::open(&config.storage)
            .await
            .context("failed to open local storage")?;

        #[cfg(feature = "api")]
        let listener = crate::api::ApiListener::bind(&config.api).await?;

        let remote = match &config.remote {
            Some(remote) => Some(Arc::new(RemoteQueueManager::spawn(remote)?)),
            None => {
                warn!("no remote storage configured; samples are kept in local storage only");
                None
            }
        };

        let notifier = NotifierHandle::spawn(
            config.alertmanager_url.as_deref(),
            config.notification_queue_capacity,
        )?;
        let notifications = notifier
            .sender()
            .await
            .context("notification queue closed during startup")?;

        let (sample_tx, sample_rx, queue_closer) = queue::bounded(config.samples_queue_capacity);
        let queue_observer = queue_closer.observer();

        let rules = RuleManagerHandle::spawn(
            config.rules.clone(),
            RuleContext {
                storage: storage.clone(),
                samples: sample_tx.clone(),
                notifications,
                global_labels: config.global_labels.clone(),
            },
            config.evaluation_interval(),
        );

        let targets = Arc::new(TargetManagerHandle::spawn(
            &config.targets,
            &config.global_labels,
            config.concurrent_retrieval_allowance,
            sample_tx,
        )?);

        let retention = RetentionHandle::spawn(
            storage.clone(),
            Duration::from_secs(config.retention.interval_secs),
            Duration::from_secs(config.retention.max_age_secs),
        );

        let remote_sink = remote.clone().map(|remote| remote as Arc<dyn RemoteSink>);
        let sink = storage.clone().into_sink();

        let subsystems = Subsystems {
            target_manager: Box::new(targets.clone()),
            rule_manager: Box::new(rules.clone()),
            storage_tasks: vec![Box::new(retention) as Box<dyn Subsystem>],
            storage: sink.clone(),
            remote: remote_sink.clone(),
            notifications: Box::new(notifier),
        };

        let (coordinator, shutdown) = ShutdownCoordinator::new(
            subsystems,
            queue_closer,
            config.shutdown_grace_period(),
            config.grace_policy,
        );
        let coordinator =
            tokio::spawn(coordinator.with_step_timeout(config.shutdown_step_timeout()).run());

        #[cfg(feature = "api")]
        let api_addr = {
            let addr = listener.local_addr()?;
            let state = crate::api::ApiState {
                storage: storage.clone(),
                targets: targets.clone(),
                rules: rules.clone(),
                remote: remote.clone(),
                queue: queue_observer,
                shutdown: shutdown.clone(),
                runtime: Arc::new(crate::api::RuntimeInfo {
                    config: config.clone(),
                    flags,
                    birth,
                }),
            };
            listener.serve(state);
            Some(addr)
        };

        #[cfg(not(feature = "api"))]
        let api_addr = {
            let _ = (queue_observer, flags, birth);
            None
        };

        info!("server is ready to receive requests");

        Ok(Self {
            fan_out: FanOut::new(sink, remote_sink),
            samples: sample_rx,
            coordinator,
            shutdown,
            storage,
            targets,
            rules,
            api_addr,
        })
    }

    /// Trigger side of the shutdown gate
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Address the API server listens on, if it is compiled in
    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api_addr
    }

    pub fn storage(&self) -> Arc<dyn StorageBackend> {
        self.storage.clone()
    }

    pub fn targets(&self) -> Arc<TargetManagerHandle> {
        self.targets.clone()
    }

    pub fn rules(&self) -> RuleManagerHandle {
        self.rules.clone()
    }

    /// Run the fan-out loop until shutdown has closed the queue
    ///
    /// Returns once the shutdown sequence has completed. A fan-out loop that
    /// is still blocked at that point is abandoned.
    pub async fn serve(self) -> Result<ServeReport> {
        let fan_out = self.fan_out.run(self.samples);
        tokio::pin!(fan_out);
        let mut coordinator = self.coordinator;

        let (fan_out, shutdown) = tokio::select! {
            biased;

            stats = &mut fan_out => {
                debug!("fan-out loop returned, waiting for shutdown to complete");
                (Some(stats), coordinator.await)
            }

            shutdown = &mut coordinator => {
                warn!("shutdown completed while the fan-out loop was still blocked; abandoning it");
                (None, shutdown)
            }
        };

        let shutdown = shutdown.context("shutdown coordinator panicked")?;
        Ok(ServeReport { fan_out, shutdown })
    }
}
