use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::LabelSet;
use crate::storage::Selector;
use crate::util::{is_valid_label_name, is_valid_metric_name};

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    Memory {
        #[serde(default = "default_max_samples_per_series")]
        max_samples_per_series: usize,
    },

    /// SQLite database (default)
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./metrics.db")
}

fn default_max_samples_per_series() -> usize {
    crate::storage::memory::DEFAULT_MAX_SAMPLES_PER_SERIES
}

/// How old samples are deleted from local storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Time between retention sweeps
    pub interval_secs: u64,

    /// Samples older than this are deleted
    pub max_age_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: 11 * 60 * 60,
            max_age_secs: 15 * 24 * 60 * 60,
        }
    }
}

/// Remote long-term storage forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Endpoint accepting OpenTSDB `put` JSON
    pub url: String,

    #[serde(default = "default_remote_timeout")]
    pub timeout_secs: u64,

    /// Number of sample batches buffered before new ones are discarded
    #[serde(default = "default_remote_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_samples_per_send")]
    pub max_samples_per_send: usize,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout_secs: default_remote_timeout(),
            queue_capacity: default_remote_queue_capacity(),
            max_samples_per_send: default_max_samples_per_send(),
        }
    }
}

fn default_remote_timeout() -> u64 {
    30
}

fn default_remote_queue_capacity() -> usize {
    100
}

fn default_max_samples_per_send() -> usize {
    512
}

/// Web API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,

    /// Optional bearer token required on every request
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            auth_token: None,
            enable_cors: true,
        }
    }
}

/// What to do during the shutdown grace period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GracePolicy {
    /// Sleep for the whole grace period
    #[default]
    Fixed,

    /// Stop waiting as soon as the sample queue is empty
    Drain,
}

/// A scrape target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Job name, attached as the `job` label
    pub job: String,

    /// Full URL of the JSON exposition endpoint
    pub url: String,

    #[serde(default = "default_scrape_interval")]
    pub interval: u64,

    #[serde(default, skip_serializing)]
    pub token: Option<String>,

    /// Extra labels attached to every sample of this target
    #[serde(default)]
    pub labels: LabelSet,
}

fn default_scrape_interval() -> u64 {
    15
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl Aggregation {
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }

        let result = match self {
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Count => values.len() as f64,
        };

        Some(result)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
}

impl Comparison {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Greater => value > threshold,
            Comparison::GreaterOrEqual => value >= threshold,
            Comparison::Less => value < threshold,
            Comparison::LessOrEqual => value <= threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingRule {
    /// Name of the produced metric
    pub record: String,
    pub expr: Selector,
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertingRule {
    pub alert: String,
    pub expr: Selector,
    pub op: Comparison,
    pub threshold: f64,

    /// Consecutive exceeding evaluations tolerated before firing
    #[serde(rename = "for", default)]
    pub for_evaluations: usize,

    #[serde(default)]
    pub labels: LabelSet,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleConfig {
    Recording(RecordingRule),
    Alerting(AlertingRule),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Labels attached to every scraped sample
    pub global_labels: LabelSet,

    pub samples_queue_capacity: usize,
    pub notification_queue_capacity: usize,
    pub concurrent_retrieval_allowance: usize,

    /// Time background work gets to flush during shutdown
    pub shutdown_grace_period_secs: u64,
    pub grace_policy: GracePolicy,

    /// Longest any single shutdown step may take before it is abandoned
    pub shutdown_step_timeout_secs: u64,

    /// Rule evaluation interval in seconds
    pub evaluation_interval: u64,

    pub alertmanager_url: Option<String>,

    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub remote: Option<RemoteConfig>,
    pub api: ApiConfig,

    pub targets: Vec<TargetConfig>,
    pub rules: Vec<RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_labels: LabelSet::new(),
            samples_queue_capacity: 4096,
            notification_queue_capacity: 100,
            concurrent_retrieval_allowance: 15,
            shutdown_grace_period_secs: 0,
            grace_policy: GracePolicy::default(),
            shutdown_step_timeout_secs: 2,
            evaluation_interval: 15,
            alertmanager_url: None,
            storage: StorageConfig::default(),
            retention: RetentionConfig::default(),
            remote: None,
            api: ApiConfig::default(),
            targets: vec![],
            rules: vec![],
        }
    }
}

impl Config {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn shutdown_step_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_step_timeout_secs)
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval)
    }

    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.samples_queue_capacity == 0 {
            bail!("samples_queue_capacity must be greater than zero");
        }
        if self.notification_queue_capacity == 0 {
            bail!("notification_queue_capacity must be greater than zero");
        }
        if self.concurrent_retrieval_allowance == 0 {
            bail!("concurrent_retrieval_allowance must be greater than zero");
        }
        if self.shutdown_step_timeout_secs == 0 {
            bail!("shutdown_step_timeout_secs must be greater than zero");
        }
        if self.evaluation_interval == 0 {
            bail!("evaluation_interval must be greater than zero");
        }

        validate_labels("global_labels", &self.global_labels)?;

        let mut jobs = HashSet::new();
        for target in &self.targets {
            if !jobs.insert((&target.job, &target.url)) {
                bail!("duplicate target {} ({})", target.job, target.url);
            }
            if target.interval == 0 {
                bail!("target {}: interval must be greater than zero", target.job);
            }
            reqwest::Url::parse(&target.url)
                .with_context(|| format!("target {}: invalid url {}", target.job, target.url))?;
            validate_labels(&format!("target {}", target.job), &target.labels)?;
        }

        for rule in &self.rules {
            let (name, expr) = match rule {
                RuleConfig::Recording(rule) => (&rule.record, &rule.expr),
                RuleConfig::Alerting(rule) => (&rule.alert, &rule.expr),
            };
            if name.is_empty() {
                bail!("rule without a name");
            }
            if expr.metric.is_empty() {
                bail!("rule {name}: expr.metric must not be empty");
            }
            if let RuleConfig::Recording(rule) = rule {
                if !is_valid_metric_name(&rule.record) {
                    bail!("rule {name}: invalid metric name");
                }
            }
            if let RuleConfig::Alerting(rule) = rule {
                validate_labels(&format!("rule {name}"), &rule.labels)?;
            }
        }

        if let Some(remote) = &self.remote {
            reqwest::Url::parse(&remote.url)
                .with_context(|| format!("invalid remote url {}", remote.url))?;
            if remote.queue_capacity == 0 || remote.max_samples_per_send == 0 {
                bail!("remote queue_capacity and max_samples_per_send must be greater than zero");
            }
        }

        Ok(())
    }
}

fn validate_labels(scope: &str, labels: &LabelSet) -> anyhow::Result<()> {
    if let Some(name) = labels.keys().find(|name| !is_valid_label_name(name)) {
        bail!("{scope}: invalid label name {name:?}");
    }
    Ok(())
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration file {path}"))?;

    let config: Config = serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {path}"))?;

    config.validate()?;
    trace!("loaded config: {config:?}");

    Ok(config)
}
