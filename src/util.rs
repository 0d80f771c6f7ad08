use std::sync::LazyLock;

use regex::Regex;

use crate::{LabelSet, METRIC_NAME_LABEL};

/// Prefix given to exposed labels that collide with target or global labels
pub const EXPORTER_LABEL_PREFIX: &str = "exporter_";

static LABEL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("label name pattern is valid"));

static METRIC_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$").expect("metric name pattern is valid")
});

pub fn is_valid_label_name(name: &str) -> bool {
    LABEL_NAME.is_match(name)
}

/// Metric names may additionally contain colons (`job:node_load1:sum`)
pub fn is_valid_metric_name(name: &str) -> bool {
    METRIC_NAME.is_match(name)
}

/// Merge `labels` into `metric`
///
/// When `metric` already carries one of the labels, the existing value is moved
/// to `exporter_<name>` so the authoritative value from `labels` wins without
/// losing what the target exposed.
pub fn merge_labels(metric: &mut LabelSet, labels: &LabelSet) {
    for (name, value) in labels {
        if name == METRIC_NAME_LABEL {
            continue;
        }

        if let Some(exposed) = metric.insert(name.clone(), value.clone()) {
            if &exposed != value {
                metric.insert(format!("{EXPORTER_LABEL_PREFIX}{name}"), exposed);
            }
        }
    }
}
