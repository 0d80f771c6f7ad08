pub mod actors;
#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod fanout;
pub mod lifecycle;
pub mod queue;
pub mod server;
pub mod storage;
pub mod util;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved label holding the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// Ordered set of label name/value pairs identifying a series
pub type LabelSet = BTreeMap<String, String>;

/// A single timestamped measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric: LabelSet,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(name: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        let mut metric = LabelSet::new();
        metric.insert(METRIC_NAME_LABEL.to_string(), name.into());

        Self {
            metric,
            value,
            timestamp,
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metric.insert(name.into(), value.into());
        self
    }

    /// Metric name, empty if the sample carries no `__name__` label
    pub fn name(&self) -> &str {
        self.metric
            .get(METRIC_NAME_LABEL)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Stable series identifier (`name{a="b",c="d"}`)
    pub fn series_id(&self) -> String {
        series_id(&self.metric)
    }
}

/// Render a label set the way series are addressed in storage and the API
///
/// Label names and values come from scraped targets, so `\`, `"` and newlines
/// are escaped to keep distinct label sets from rendering the same.
pub fn series_id(metric: &LabelSet) -> String {
    let name = metric
        .get(METRIC_NAME_LABEL)
        .map(String::as_str)
        .unwrap_or_default();

    let labels = metric
        .iter()
        .filter(|(k, _)| k.as_str() != METRIC_NAME_LABEL)
        .map(|(k, v)| format!("{}=\"{}\"", escape_label(k), escape_label(v)))
        .collect::<Vec<_>>()
        .join(",");

    format!("{name}{{{labels}}}")
}

fn escape_label(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\\', '"', '\n']) {
        return Cow::Borrowed(raw);
    }

    let mut escaped = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    Cow::Owned(escaped)
}

/// Why a producer could not deliver samples
#[derive(Debug, Clone, PartialEq)]
pub enum BatchError {
    /// Transport-level failure talking to the target
    Unreachable(String),

    /// Target answered with a non-success status
    HttpStatus(u16),

    /// Body could not be decoded as an exposition
    Decode(String),

    /// Rule evaluation could not read its inputs
    Evaluation(String),
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::Unreachable(msg) => write!(f, "target unreachable: {msg}"),
            BatchError::HttpStatus(status) => write!(f, "target returned HTTP {status}"),
            BatchError::Decode(msg) => write!(f, "failed to decode exposition: {msg}"),
            BatchError::Evaluation(msg) => write!(f, "rule evaluation failed: {msg}"),
        }
    }
}

impl std::error::Error for BatchError {}

/// Unit of hand-off between producers and the fan-out loop
///
/// A batch either carries samples or the reason none could be produced. Only
/// non-empty `Samples` batches ever reach a sink.
#[derive(Debug, Clone, PartialEq)]
pub enum SampleBatch {
    Samples(Vec<Sample>),
    Failed(BatchError),
}

impl SampleBatch {
    /// Samples worth forwarding, `None` for failed or empty batches
    pub fn into_forwardable(self) -> Option<Vec<Sample>> {
        match self {
            SampleBatch::Samples(samples) if !samples.is_empty() => Some(samples),
            SampleBatch::Samples(_) | SampleBatch::Failed(_) => None,
        }
    }
}

impl From<Vec<Sample>> for SampleBatch {
    fn from(samples: Vec<Sample>) -> Self {
        SampleBatch::Samples(samples)
    }
}
