//! API shared state containing actor handles

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::actors::{RemoteQueueManager, RuleManagerHandle, TargetManagerHandle};
use crate::config::Config;
use crate::lifecycle::ShutdownHandle;
use crate::queue::QueueObserver;
use crate::storage::StorageBackend;

/// Static process information reported by `/api/v1/status`
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub config: Config,

    /// Command line flags as given, keyed by long flag name
    pub flags: BTreeMap<String, String>,

    pub birth: DateTime<Utc>,
}

/// Shared state passed to all API handlers
#[derive(Clone)]
pub struct ApiState {
    pub storage: Arc<dyn StorageBackend>,
    pub targets: Arc<TargetManagerHandle>,
    pub rules: RuleManagerHandle,
    pub remote: Option<Arc<RemoteQueueManager>>,
    pub queue: QueueObserver,

    /// Trigger side of the shutdown gate, used by the quit endpoint
    pub shutdown: ShutdownHandle,

    pub runtime: Arc<RuntimeInfo>,
}
