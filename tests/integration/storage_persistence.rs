//! SQLite persistence across restarts

use std::time::Duration;

use chrono::Utc;
use metrics_hub::config::StorageConfig;
use metrics_hub::lifecycle::ShutdownTrigger;
use metrics_hub::server::Server;
use metrics_hub::storage::sqlite::SqliteBackend;
use metrics_hub::storage::{SampleSink, Selector, StorageBackend};
use metrics_hub::Sample;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::MockServer;

use crate::helpers::*;

#[tokio::test]
async fn test_samples_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("metrics.db");
    let now = Utc::now();

    {
        let backend = SqliteBackend::new(&db_path).await.unwrap();
        backend
            .append(&[
                Sample::new("node_load1", 0.5, now).with_label("instance", "a"),
                Sample::new("node_load1", 1.5, now).with_label("instance", "b"),
            ])
            .await
            .unwrap();
        backend.close().await.unwrap();
    }

    let backend = SqliteBackend::new(&db_path).await.unwrap();
    let samples = backend
        .query_latest(&Selector::metric("node_load1").with_matcher("instance", "b"))
        .await
        .unwrap();

    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 1.5);
    assert_eq!(backend.stats().await.unwrap().total_series, 2);
}

#[tokio::test]
async fn test_hub_flushes_to_sqlite_before_exit() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("hub.db");

    let target_server = MockServer::start().await;
    mount_target(&target_server, "/metrics", &[("node_load1", 0.5)]).await;

    let mut config = test_config();
    config.storage = StorageConfig::Sqlite {
        path: db_path.clone(),
    };
    config.targets = vec![target("node", format!("{}/metrics", target_server.uri()))];

    let server = Server::start(config, Default::default()).await.unwrap();
    let targets = server.targets();
    let shutdown = server.shutdown_handle();

    // Enqueued before the fan-out loop runs; shutdown must still store it
    targets.collectors()[0].poll_now().await.unwrap();

    let serving = tokio::spawn(server.serve());
    shutdown.shutdown(ShutdownTrigger::Terminate).await;
    let report = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(report.shutdown.failed_steps.is_empty());

    let backend = SqliteBackend::new(&db_path).await.unwrap();
    let samples = backend
        .query_latest(&Selector::metric("node_load1").with_matcher("job", "node"))
        .await
        .unwrap();
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].value, 0.5);
}
