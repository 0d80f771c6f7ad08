//! Message types for actor communication
//!
//! Commands are sent to a specific actor over its mpsc channel; queries carry
//! a oneshot sender for the reply.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::LabelSet;

/// Commands that can be sent to a target collector
#[derive(Debug)]
pub enum CollectorCommand {
    /// Scrape immediately, bypassing the interval timer
    ///
    /// Replies with the number of samples scraped (excluding `up`).
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<usize>>,
    },

    /// Report the current health of the target
    GetHealth {
        respond_to: oneshot::Sender<TargetHealth>,
    },
}

/// Commands that can be sent to the rule manager
#[derive(Debug)]
pub enum RuleCommand {
    /// Evaluate every rule once, bypassing the interval timer
    EvaluateNow {
        respond_to: oneshot::Sender<anyhow::Result<()>>,
    },

    /// List alerts that are pending or firing
    GetAlerts {
        respond_to: oneshot::Sender<Vec<ActiveAlert>>,
    },

    /// Stop evaluating; replies once the actor has exited
    Shutdown { respond_to: oneshot::Sender<()> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Unknown,
    Up,
    Down,
}

/// Last known state of a scrape target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetHealth {
    pub job: String,
    pub url: String,
    pub labels: LabelSet,
    pub health: Health,
    pub last_scrape: Option<DateTime<Utc>>,
    pub last_scrape_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub samples_scraped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    /// Threshold crossed, still inside the `for` window
    Pending,
    Firing,
}

/// An alert tracked by the rule manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub alert: String,
    pub labels: LabelSet,
    pub annotations: BTreeMap<String, String>,
    pub state: AlertState,
    pub value: f64,
    pub active_since: DateTime<Utc>,
}

/// Alert notification in the Alertmanager v1 wire format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub labels: LabelSet,
    pub annotations: BTreeMap<String, String>,
    pub starts_at: DateTime<Utc>,

    /// Set when the alert has resolved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,

    #[serde(rename = "generatorURL", skip_serializing_if = "Option::is_none")]
    pub generator_url: Option<String>,
}

impl Notification {
    pub fn is_resolved(&self) -> bool {
        self.ends_at.is_some()
    }
}
