//! End-to-end tests of the scrape → queue → fan-out → storage/remote pipeline

use std::sync::Arc;
use std::time::Duration;

use metrics_hub::config::{
    AlertingRule, Aggregation, Comparison, RecordingRule, RemoteConfig, RuleConfig,
};
use metrics_hub::fanout::FanOut;
use metrics_hub::lifecycle::ShutdownTrigger;
use metrics_hub::queue;
use metrics_hub::server::Server;
use metrics_hub::storage::Selector;
use metrics_hub::{BatchError, LabelSet, SampleBatch};
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

#[tokio::test]
async fn test_failed_and_empty_batches_never_reach_sinks() {
    let storage = Arc::new(RecordingSink::default());
    let remote = Arc::new(RecordingRemote::default());
    let (tx, rx, closer) = queue::bounded(2);

    let fan_out = tokio::spawn(FanOut::new(storage.clone(), Some(remote.clone())).run(rx));

    tx.enqueue(batch(&[1.0])).await.unwrap();
    tx.enqueue(SampleBatch::Failed(BatchError::HttpStatus(503)))
        .await
        .unwrap();
    tx.enqueue(SampleBatch::Samples(vec![])).await.unwrap();
    tx.enqueue(batch(&[2.0, 3.0])).await.unwrap();

    drop(tx);
    closer.close().await;
    let stats = fan_out.await.unwrap();

    assert_eq!(*storage.appended.lock().unwrap(), vec![vec![1.0], vec![2.0, 3.0]]);
    assert_eq!(*remote.enqueued.lock().unwrap(), vec![vec![1.0], vec![2.0, 3.0]]);
    assert_eq!(stats.batches_received, 4);
    assert_eq!(stats.batches_forwarded, 2);
    assert_eq!(stats.failed_batches_dropped, 1);
    assert_eq!(stats.empty_batches_dropped, 1);
}

#[tokio::test]
async fn test_scraped_samples_reach_local_storage() {
    let target_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "name": "node_load1", "value": 0.75, "labels": { "job": "exporter", "cpu": "0" } }
        ])))
        .mount(&target_server)
        .await;

    let mut config = test_config();
    config.global_labels = LabelSet::from([("region".to_string(), "eu".to_string())]);
    let mut node = target("node", format!("{}/metrics", target_server.uri()));
    node.labels.insert("team".to_string(), "infra".to_string());
    config.targets = vec![node];

    let server = Server::start(config, Default::default()).await.unwrap();
    let storage = server.storage();
    let targets = server.targets();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    assert_eq!(targets.collectors()[0].poll_now().await.unwrap(), 1);

    let stored = wait_until(Duration::from_secs(5), || async {
        !storage
            .query_latest(&Selector::metric("node_load1"))
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    assert!(stored, "scraped sample never reached storage");

    let samples = storage
        .query_latest(&Selector::metric("node_load1"))
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    let labels = &samples[0].metric;
    assert_eq!(labels["job"], "node");
    assert_eq!(labels["exporter_job"], "exporter");
    assert_eq!(labels["cpu"], "0");
    assert_eq!(labels["team"], "infra");
    assert_eq!(labels["region"], "eu");
    assert_eq!(samples[0].value, 0.75);

    let up = storage
        .query_latest(&Selector::metric("up").with_matcher("job", "node"))
        .await
        .unwrap();
    assert_eq!(up.len(), 1);
    assert_eq!(up[0].value, 1.0);

    shutdown.shutdown(ShutdownTrigger::Quit).await;
    let report = serving.await.unwrap().unwrap();

    assert_eq!(report.shutdown.trigger, ShutdownTrigger::Quit);
    assert!(report.shutdown.failed_steps.is_empty());
    assert!(report.fan_out.unwrap().samples_appended >= 2);
}

#[tokio::test]
async fn test_failing_target_records_down() {
    let target_server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&target_server)
        .await;

    let mut config = test_config();
    config.targets = vec![target("broken", format!("{}/metrics", target_server.uri()))];

    let server = Server::start(config, Default::default()).await.unwrap();
    let storage = server.storage();
    let targets = server.targets();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    assert!(targets.collectors()[0].poll_now().await.is_err());

    let recorded = wait_until(Duration::from_secs(5), || async {
        storage
            .query_latest(&Selector::metric("up").with_matcher("job", "broken"))
            .await
            .unwrap()
            .iter()
            .any(|s| s.value == 0.0)
    })
    .await;
    assert!(recorded, "up 0 never reached storage");

    shutdown.shutdown(ShutdownTrigger::Interrupt).await;
    let report = serving.await.unwrap().unwrap();
    assert!(report.fan_out.unwrap().failed_batches_dropped >= 1);
}

#[tokio::test]
async fn test_samples_are_forwarded_to_remote_storage() {
    let target_server = MockServer::start().await;
    mount_target(&target_server, "/metrics", &[("node_load1", 0.5)]).await;

    let remote_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/put"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&remote_server)
        .await;

    let mut config = test_config();
    config.targets = vec![target("node", format!("{}/metrics", target_server.uri()))];
    config.remote = Some(RemoteConfig::new(format!("{}/api/put", remote_server.uri())));

    let server = Server::start(config, Default::default()).await.unwrap();
    let targets = server.targets();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    targets.collectors()[0].poll_now().await.unwrap();

    // Closing the forwarder flushes whatever is still buffered
    shutdown.shutdown(ShutdownTrigger::Terminate).await;
    let report = serving.await.unwrap().unwrap();
    assert!(report.shutdown.failed_steps.is_empty());

    let requests = remote_server.received_requests().await.unwrap();
    let points = requests
        .iter()
        .flat_map(|r| serde_json::from_slice::<Vec<serde_json::Value>>(&r.body).unwrap())
        .collect::<Vec<_>>();

    let load = points
        .iter()
        .find(|p| p["metric"] == "node_load1")
        .expect("node_load1 was not forwarded");
    assert_eq!(load["value"], 0.5);
    assert_eq!(load["tags"]["job"], "node");
    assert!(load["timestamp"].is_i64());
    assert!(points.iter().any(|p| p["metric"] == "up"));
}

#[tokio::test]
async fn test_recording_rule_output_is_stored() {
    let target_server = MockServer::start().await;
    mount_target(&target_server, "/a", &[("node_load1", 0.5)]).await;
    mount_target(&target_server, "/b", &[("node_load1", 1.5)]).await;

    let mut config = test_config();
    config.targets = vec![
        target("node", format!("{}/a", target_server.uri())),
        target("node", format!("{}/b", target_server.uri())),
    ];
    config.evaluation_interval = 3600;
    config.rules = vec![RuleConfig::Recording(RecordingRule {
        record: "job:node_load1:sum".to_string(),
        expr: Selector::metric("node_load1").with_matcher("job", "node"),
        aggregation: Aggregation::Sum,
    })];

    let server = Server::start(config, Default::default()).await.unwrap();
    let storage = server.storage();
    let targets = server.targets();
    let rules = server.rules();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    for collector in targets.collectors() {
        collector.poll_now().await.unwrap();
    }
    let scraped = wait_until(Duration::from_secs(5), || async {
        storage
            .query_latest(&Selector::metric("node_load1"))
            .await
            .unwrap()
            .len()
            == 2
    })
    .await;
    assert!(scraped);

    rules.evaluate_now().await.unwrap();

    let recorded = wait_until(Duration::from_secs(5), || async {
        !storage
            .query_latest(&Selector::metric("job:node_load1:sum"))
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    assert!(recorded, "recording rule output never reached storage");

    let sum = storage
        .query_latest(&Selector::metric("job:node_load1:sum"))
        .await
        .unwrap();
    assert_eq!(sum[0].value, 2.0);
    assert_eq!(sum[0].metric["job"], "node");

    shutdown.shutdown(ShutdownTrigger::Quit).await;
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_firing_alert_is_sent_to_alertmanager() {
    let target_server = MockServer::start().await;
    mount_target(&target_server, "/metrics", &[("node_load1", 4.0)]).await;

    let alertmanager = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/alerts"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1..)
        .mount(&alertmanager)
        .await;

    let mut config = test_config();
    config.targets = vec![target("node", format!("{}/metrics", target_server.uri()))];
    config.alertmanager_url = Some(alertmanager.uri());
    config.evaluation_interval = 3600;
    config.rules = vec![RuleConfig::Alerting(AlertingRule {
        alert: "HighLoad".to_string(),
        expr: Selector::metric("node_load1"),
        op: Comparison::Greater,
        threshold: 2.0,
        for_evaluations: 0,
        labels: LabelSet::from([("severity".to_string(), "page".to_string())]),
        annotations: Default::default(),
    })];

    let server = Server::start(config, Default::default()).await.unwrap();
    let storage = server.storage();
    let targets = server.targets();
    let rules = server.rules();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    targets.collectors()[0].poll_now().await.unwrap();
    let scraped = wait_until(Duration::from_secs(5), || async {
        !storage
            .query_latest(&Selector::metric("node_load1"))
            .await
            .unwrap()
            .is_empty()
    })
    .await;
    assert!(scraped);

    rules.evaluate_now().await.unwrap();
    let alerts = rules.alerts().await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].alert, "HighLoad");

    // Stopping the notification queue delivers what is still buffered
    shutdown.shutdown(ShutdownTrigger::Quit).await;
    serving.await.unwrap().unwrap();

    let requests = alertmanager.received_requests().await.unwrap();
    let notifications = requests
        .iter()
        .flat_map(|r| serde_json::from_slice::<Vec<serde_json::Value>>(&r.body).unwrap())
        .collect::<Vec<_>>();

    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0]["labels"]["alertname"], "HighLoad");
    assert_eq!(notifications[0]["labels"]["severity"], "page");
    assert_eq!(notifications[0]["labels"]["job"], "node");
    assert!(notifications[0].get("startsAt").is_some());
    assert!(notifications[0].get("endsAt").is_none());
}
