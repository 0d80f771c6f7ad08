//! RuleManager - evaluates recording and alerting rules
//!
//! Recording rules aggregate the latest sample of every matching series into
//! a new sample, which re-enters the pipeline through the sample queue.
//!
//! ## Alert Grace Period State Machine
//!
//! Alerting rules track a grace counter per series:
//!
//! ```text
//! Condition false:
//!   counter <= for               → RuleEvaluation::Ok (reset, no notification)
//!   counter >  for               → RuleEvaluation::BackToOk (send resolved)
//!
//! Condition true:
//!   counter <  for               → RuleEvaluation::Exceeding (pending)
//!   counter == for               → RuleEvaluation::StartsToExceed (send firing)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::{AlertingRule, RecordingRule, RuleConfig};
use crate::lifecycle::Subsystem;
use crate::queue::SampleSender;
use crate::storage::StorageBackend;
use crate::util::merge_labels;
use crate::{BatchError, LabelSet, METRIC_NAME_LABEL, Sample, SampleBatch, series_id};

use super::messages::{ActiveAlert, AlertState, Notification, RuleCommand};

/// Label carrying the alerting rule name on notifications
pub const ALERT_NAME_LABEL: &str = "alertname";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEvaluation {
    Ok,
    Exceeding,
    StartsToExceed,
    BackToOk,
}

impl RuleEvaluation {
    pub fn evaluate(condition: bool, grace: usize, current_grace: usize) -> RuleEvaluation {
        if !condition {
            if current_grace > grace {
                return RuleEvaluation::BackToOk;
            }
            return RuleEvaluation::Ok;
        }

        if current_grace == grace {
            return RuleEvaluation::StartsToExceed;
        }

        RuleEvaluation::Exceeding
    }
}

/// Per-series state of an alerting rule
#[derive(Debug, Clone)]
struct SeriesAlertState {
    labels: LabelSet,
    grace_counter: usize,
    value: f64,
    active_since: DateTime<Utc>,
}

/// Resources the rule manager works with
pub struct RuleContext {
    pub storage: Arc<dyn StorageBackend>,
    pub samples: SampleSender,
    pub notifications: mpsc::Sender<Notification>,
    pub global_labels: LabelSet,
}

pub struct RuleManager {
    recording: Vec<RecordingRule>,
    alerting: Vec<AlertingRule>,
    context: RuleContext,
    interval_duration: Duration,
    command_rx: mpsc::Receiver<RuleCommand>,

    /// Keyed by (rule index, series id)
    alerts: HashMap<(usize, String), SeriesAlertState>,
}

impl RuleManager {
    pub fn new(
        rules: Vec<RuleConfig>,
        context: RuleContext,
        interval_duration: Duration,
        command_rx: mpsc::Receiver<RuleCommand>,
    ) -> Self {
        let mut recording = vec![];
        let mut alerting = vec![];
        for rule in rules {
            match rule {
                RuleConfig::Recording(rule) => recording.push(rule),
                RuleConfig::Alerting(rule) => alerting.push(rule),
            }
        }

        Self {
            recording,
            alerting,
            context,
            interval_duration,
            command_rx,
            alerts: HashMap::new(),
        }
    }

    #[instrument(skip(self), fields(recording = self.recording.len(), alerting = self.alerting.len()))]
    pub async fn run(mut self) {
        debug!("starting rule manager");

        let mut ticker = interval(self.interval_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; let the first scrapes land first
        ticker.tick().await;

        let mut reply = None;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate().await {
                        error!("rule evaluation failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RuleCommand::EvaluateNow { respond_to } => {
                            debug!("received EvaluateNow command");
                            let _ = respond_to.send(self.evaluate().await);
                        }

                        RuleCommand::GetAlerts { respond_to } => {
                            let _ = respond_to.send(self.active_alerts());
                        }

                        RuleCommand::Shutdown { respond_to } => {
                            debug!("received shutdown command");
                            reply = Some(respond_to);
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        // Release the queue sender before confirming the stop
        drop(self);
        debug!("rule manager stopped");

        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    async fn evaluate(&mut self) -> Result<()> {
        let now = Utc::now();

        for rule in &self.recording {
            let batch = match self.record(rule, now).await {
                Ok(Some(sample)) => SampleBatch::Samples(vec![sample]),
                Ok(None) => continue,
                Err(e) => SampleBatch::Failed(BatchError::Evaluation(format!("{}: {e}", rule.record))),
            };

            self.context
                .samples
                .enqueue(batch)
                .await
                .context("sample queue closed")?;
        }

        for index in 0..self.alerting.len() {
            if let Err(e) = self.evaluate_alert(index, now).await {
                warn!("alerting rule {} failed: {e:#}", self.alerting[index].alert);
            }
        }

        Ok(())
    }

    async fn record(&self, rule: &RecordingRule, now: DateTime<Utc>) -> Result<Option<Sample>> {
        let latest = self.context.storage.query_latest(&rule.expr).await?;
        let values = latest.iter().map(|s| s.value).collect::<Vec<_>>();

        let Some(value) = rule.aggregation.apply(&values) else {
            trace!("{}: no matching series", rule.record);
            return Ok(None);
        };

        let mut metric = rule.expr.matchers.clone();
        metric.insert(METRIC_NAME_LABEL.to_string(), rule.record.clone());
        merge_labels(&mut metric, &self.context.global_labels);

        trace!("{}: {:?} over {} series = {value}", rule.record, rule.aggregation, values.len());

        Ok(Some(Sample {
            metric,
            value,
            timestamp: now,
        }))
    }

    #[instrument(skip(self, now), fields(alert = %self.alerting[index].alert))]
    async fn evaluate_alert(&mut self, index: usize, now: DateTime<Utc>) -> Result<()> {
        let rule = self.alerting[index].clone();
        let latest = self.context.storage.query_latest(&rule.expr).await?;

        let mut seen = vec![];
        for sample in latest {
            let id = sample.series_id();
            let condition = rule.op.holds(sample.value, rule.threshold);
            self.transition(index, &rule, id.clone(), &sample.metric, sample.value, condition, now);
            seen.push(id);
        }

        // Series that stopped reporting count as recovered
        let vanished = self
            .alerts
            .iter()
            .filter(|((i, id), _)| *i == index && !seen.contains(id))
            .map(|((_, id), state)| (id.clone(), state.labels.clone(), state.value))
            .collect::<Vec<_>>();
        for (id, metric, value) in vanished {
            self.transition(index, &rule, id, &metric, value, false, now);
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn transition(
        &mut self,
        index: usize,
        rule: &AlertingRule,
        id: String,
        metric: &LabelSet,
        value: f64,
        condition: bool,
        now: DateTime<Utc>,
    ) {
        let key = (index, id);
        let grace_counter = self.alerts.get(&key).map(|s| s.grace_counter).unwrap_or(0);
        let evaluation = RuleEvaluation::evaluate(condition, rule.for_evaluations, grace_counter);

        trace!(
            "{}: {value} {:?} {}, grace {}/{} → {evaluation:?}",
            key.1, rule.op, rule.threshold, grace_counter, rule.for_evaluations
        );

        match evaluation {
            RuleEvaluation::Ok => {
                self.alerts.remove(&key);
            }

            RuleEvaluation::Exceeding => {
                let state = self.alerts.entry(key).or_insert_with(|| SeriesAlertState {
                    labels: metric.clone(),
                    grace_counter: 0,
                    value,
                    active_since: now,
                });
                state.grace_counter += 1;
                state.value = value;
            }

            RuleEvaluation::StartsToExceed => {
                let state = self.alerts.entry(key).or_insert_with(|| SeriesAlertState {
                    labels: metric.clone(),
                    grace_counter: 0,
                    value,
                    active_since: now,
                });
                state.grace_counter += 1;
                state.value = value;

                info!("{}: alert {} is firing ({value})", series_id(metric), rule.alert);
                let notification = notification(rule, metric, state.active_since, None);
                self.notify(notification);
            }

            RuleEvaluation::BackToOk => {
                let active_since = self
                    .alerts
                    .remove(&key)
                    .map(|s| s.active_since)
                    .unwrap_or(now);

                info!("{}: alert {} resolved ({value})", series_id(metric), rule.alert);
                let notification = notification(rule, metric, active_since, Some(now));
                self.notify(notification);
            }
        }
    }

    fn notify(&self, notification: Notification) {
        match self.context.notifications.try_send(notification) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("notification queue full, dropping notification");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("notification queue closed, dropping notification");
            }
        }
    }

    fn active_alerts(&self) -> Vec<ActiveAlert> {
        let mut alerts = self
            .alerts
            .iter()
            .map(|((index, _), state)| {
                let rule = &self.alerting[*index];
                ActiveAlert {
                    alert: rule.alert.clone(),
                    labels: alert_labels(rule, &state.labels),
                    annotations: rule.annotations.clone(),
                    state: if state.grace_counter > rule.for_evaluations {
                        AlertState::Firing
                    } else {
                        AlertState::Pending
                    },
                    value: state.value,
                    active_since: state.active_since,
                }
            })
            .collect::<Vec<_>>();

        alerts.sort_by(|a, b| (&a.alert, &a.labels).cmp(&(&b.alert, &b.labels)));
        alerts
    }
}

fn alert_labels(rule: &AlertingRule, metric: &LabelSet) -> LabelSet {
    let mut labels = metric.clone();
    labels.remove(METRIC_NAME_LABEL);
    labels.extend(rule.labels.clone());
    labels.insert(ALERT_NAME_LABEL.to_string(), rule.alert.clone());
    labels
}

fn notification(
    rule: &AlertingRule,
    metric: &LabelSet,
    starts_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
) -> Notification {
    Notification {
        labels: alert_labels(rule, metric),
        annotations: rule.annotations.clone(),
        starts_at,
        ends_at,
        generator_url: None,
    }
}

/// Handle for controlling the RuleManager
#[derive(Clone)]
pub struct RuleManagerHandle {
    sender: mpsc::Sender<RuleCommand>,
}

impl RuleManagerHandle {
    pub fn spawn(rules: Vec<RuleConfig>, context: RuleContext, interval_duration: Duration) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let actor = RuleManager::new(rules, context, interval_duration, cmd_rx);
        tokio::spawn(actor.run());

        Self { sender: cmd_tx }
    }

    /// Evaluate every rule now
    pub async fn evaluate_now(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RuleCommand::EvaluateNow { respond_to: tx })
            .await
            .context("failed to send EvaluateNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn alerts(&self) -> Result<Vec<ActiveAlert>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RuleCommand::GetAlerts { respond_to: tx })
            .await
            .context("failed to send GetAlerts command")?;

        rx.await.context("failed to receive response")
    }
}

#[async_trait]
impl Subsystem for RuleManagerHandle {
    fn name(&self) -> &'static str {
        "Rule Manager"
    }

    async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        // A closed channel means the manager is already gone
        if self
            .sender
            .send(RuleCommand::Shutdown { respond_to: tx })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
        Ok(())
    }
}
