//! API endpoint tests against a running hub

use std::collections::BTreeMap;
use std::time::Duration;

use metrics_hub::config::Config;
use metrics_hub::lifecycle::{ShutdownHandle, ShutdownTrigger};
use metrics_hub::server::{ServeReport, Server};
use pretty_assertions::assert_eq;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::task::JoinHandle;
use wiremock::MockServer;

use crate::helpers::*;

struct RunningHub {
    base: String,
    server: Option<Server>,
    shutdown: ShutdownHandle,
    serving: Option<JoinHandle<anyhow::Result<ServeReport>>>,
}

impl RunningHub {
    async fn start(config: Config) -> Self {
        let flags = BTreeMap::from([("log-level".to_string(), "debug".to_string())]);
        let server = Server::start(config, flags).await.unwrap();
        let base = format!("http://{}", server.api_addr().unwrap());
        let shutdown = server.shutdown_handle();

        Self {
            base,
            server: Some(server),
            shutdown,
            serving: None,
        }
    }

    /// Run the fan-out loop in the background
    fn serve(&mut self) {
        let server = self.server.take().unwrap();
        self.serving = Some(tokio::spawn(server.serve()));
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base, route)
    }

    async fn get(&self, route: &str) -> reqwest::Response {
        reqwest::get(self.url(route)).await.unwrap()
    }

    async fn stop(mut self) -> ServeReport {
        if self.serving.is_none() {
            self.serve();
        }
        self.shutdown.shutdown(ShutdownTrigger::Quit).await;
        self.serving.take().unwrap().await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let hub = RunningHub::start(test_config()).await;

    let response = hub.get("/api/v1/health").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].is_string());

    hub.stop().await;
}

#[tokio::test]
async fn test_status_reports_runtime_information() {
    let mut config = test_config();
    config.api.auth_token = None;
    let hub = RunningHub::start(config).await;

    let response = hub.get("/api/v1/status").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["build"]["name"], "metrics-hub");
    assert_eq!(body["flags"]["log-level"], "debug");
    assert_eq!(body["samples_queue"]["capacity"], 16);
    assert_eq!(body["samples_queue"]["depth"], 0);
    assert_eq!(body["shutdown_state"], "running");
    assert_eq!(body["config"]["samples_queue_capacity"], 16);
    assert!(body["birth"].is_string());

    hub.stop().await;
}

#[tokio::test]
async fn test_targets_and_query_after_scrape() {
    let target_server = MockServer::start().await;
    mount_target(&target_server, "/metrics", &[("node_load1", 0.25)]).await;

    let mut config = test_config();
    config.targets = vec![target("node", format!("{}/metrics", target_server.uri()))];
    let mut hub = RunningHub::start(config).await;
    let targets = hub.server.as_ref().unwrap().targets();
    hub.serve();

    targets.collectors()[0].poll_now().await.unwrap();

    let stored = wait_until(Duration::from_secs(5), || async {
        let body: Value = hub
            .get("/api/v1/query?metric=node_load1")
            .await
            .json()
            .await
            .unwrap();
        body["samples"].as_array().is_some_and(|s| !s.is_empty())
    })
    .await;
    assert!(stored);

    let body: Value = hub
        .get("/api/v1/query?metric=node_load1&job=node")
        .await
        .json()
        .await
        .unwrap();
    let samples = body["samples"].as_array().unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0]["value"], 0.25);
    assert_eq!(samples[0]["metric"]["__name__"], "node_load1");

    let body: Value = hub
        .get("/api/v1/query?metric=node_load1&job=other")
        .await
        .json()
        .await
        .unwrap();
    assert!(body["samples"].as_array().unwrap().is_empty());

    let body: Value = hub
        .get("/api/v1/query_range?metric=up")
        .await
        .json()
        .await
        .unwrap();
    assert!(!body["samples"].as_array().unwrap().is_empty());

    let body: Value = hub.get("/api/v1/targets").await.json().await.unwrap();
    let listed = body["targets"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["job"], "node");
    assert_eq!(listed[0]["health"], "up");

    let body: Value = hub.get("/api/v1/stats").await.json().await.unwrap();
    assert_eq!(body["storage"]["backend"], "memory");
    assert_eq!(body["targets"], 1);
    assert!(body.get("remote").is_none());

    hub.stop().await;
}

#[tokio::test]
async fn test_query_rejects_bad_parameters() {
    let hub = RunningHub::start(test_config()).await;

    let response = hub.get("/api/v1/query").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("metric"));

    let response = hub
        .get("/api/v1/query_range?metric=up&start=2025-01-02T00:00:00Z&end=2025-01-01T00:00:00Z")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = hub.get("/api/v1/query_range?metric=up&start=yesterday").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    hub.stop().await;
}

#[tokio::test]
async fn test_alerts_endpoint_lists_nothing_without_rules() {
    let mut hub = RunningHub::start(test_config()).await;
    hub.serve();

    let response = hub.get("/api/v1/alerts").await;
    assert_eq!(response.status(), StatusCode::OK);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["alerts"], serde_json::json!([]));

    hub.stop().await;
}

#[tokio::test]
async fn test_quit_endpoint_shuts_down() {
    let mut hub = RunningHub::start(test_config()).await;
    hub.serve();

    let response = reqwest::Client::new()
        .post(hub.url("/-/quit"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response.text().await.unwrap(),
        "Requesting termination... Goodbye!"
    );

    let report = tokio::time::timeout(Duration::from_secs(5), hub.serving.take().unwrap())
        .await
        .expect("quit did not shut the hub down")
        .unwrap()
        .unwrap();
    assert_eq!(report.shutdown.trigger, ShutdownTrigger::Quit);

    // The listener goes away once shutdown has completed
    let closed = wait_until(Duration::from_secs(5), || async {
        reqwest::get(hub.url("/api/v1/health")).await.is_err()
    })
    .await;
    assert!(closed);
}

#[tokio::test]
async fn test_auth_token_is_required_when_configured() {
    let mut config = test_config();
    config.api.auth_token = Some("secret".to_string());
    let hub = RunningHub::start(config).await;
    let client = reqwest::Client::new();

    let response = client.get(hub.url("/api/v1/health")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(hub.url("/api/v1/health"))
        .header("Authorization", "Basic c2VjcmV0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = client
        .get(hub.url("/api/v1/health"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .post(hub.url("/-/quit"))
        .bearer_auth("wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = client
        .get(hub.url("/api/v1/health"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The token never leaks through the status endpoint
    let body: Value = client
        .get(hub.url("/api/v1/status"))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(body["config"]["api"].get("auth_token").is_none());

    hub.stop().await;
}
