//! Shutdown sequencing across the whole server and with recording collaborators

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics_hub::config::GracePolicy;
use metrics_hub::fanout::FanOut;
use metrics_hub::lifecycle::{
    ShutdownCoordinator, ShutdownState, ShutdownTrigger, Subsystem, Subsystems,
};
use metrics_hub::queue;
use metrics_hub::server::Server;
use pretty_assertions::assert_eq;
use wiremock::MockServer;

use crate::helpers::*;

#[tokio::test]
async fn test_concurrent_triggers_run_one_sequence() {
    let server = Server::start(test_config(), Default::default()).await.unwrap();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    let triggers = [
        ShutdownTrigger::Interrupt,
        ShutdownTrigger::Terminate,
        ShutdownTrigger::Quit,
    ];
    let callers = (0..30).map(|i| {
        let shutdown = shutdown.clone();
        let trigger = triggers[i % triggers.len()];
        tokio::spawn(async move { shutdown.shutdown(trigger).await })
    });

    for result in join_all(callers).await {
        result.unwrap();
    }

    let report = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("shutdown did not complete")
        .unwrap()
        .unwrap();

    assert!(triggers.contains(&report.shutdown.trigger));
    assert!(report.shutdown.failed_steps.is_empty());
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn test_trigger_after_stop_is_ignored() {
    let server = Server::start(test_config(), Default::default()).await.unwrap();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    shutdown.shutdown(ShutdownTrigger::Quit).await;
    serving.await.unwrap().unwrap();

    shutdown.trigger(ShutdownTrigger::Interrupt);
    tokio::time::timeout(Duration::from_secs(1), shutdown.shutdown(ShutdownTrigger::Terminate))
        .await
        .expect("waiting on a stopped server must return immediately");
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
}

#[tokio::test]
async fn test_shutdown_abandons_slow_scrape() {
    let target_server = MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .respond_with(
            wiremock::ResponseTemplate::new(200)
                .set_body_json(exposition(&[("slow", 1.0)]))
                .set_delay(Duration::from_secs(30)),
        )
        .mount(&target_server)
        .await;

    let mut config = test_config();
    config.targets = vec![target("slow", format!("{}/metrics", target_server.uri()))];

    let server = Server::start(config, Default::default()).await.unwrap();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    // Let the first scrape start
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    shutdown.shutdown(ShutdownTrigger::Interrupt).await;
    let report = serving.await.unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(report.shutdown.failed_steps.is_empty());
}

#[tokio::test]
async fn test_fixed_grace_period_is_waited_out() {
    let mut config = test_config();
    config.shutdown_grace_period_secs = 1;
    config.grace_policy = GracePolicy::Fixed;

    let server = Server::start(config, Default::default()).await.unwrap();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    shutdown.trigger(ShutdownTrigger::Terminate);
    let report = serving.await.unwrap().unwrap();

    assert_eq!(report.shutdown.trigger, ShutdownTrigger::Terminate);
    assert!(report.shutdown.elapsed >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_drain_policy_skips_grace_period_of_idle_queue() {
    let mut config = test_config();
    config.shutdown_grace_period_secs = 30;
    config.grace_policy = GracePolicy::Drain;

    let server = Server::start(config, Default::default()).await.unwrap();
    let shutdown = server.shutdown_handle();
    let serving = tokio::spawn(server.serve());

    shutdown.trigger(ShutdownTrigger::Quit);
    let report = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("drain policy waited on an empty queue")
        .unwrap()
        .unwrap();

    assert!(report.shutdown.elapsed < Duration::from_secs(30));
}

#[tokio::test]
async fn test_steps_run_in_dependency_order() {
    let log = EventLog::default();
    let storage = Arc::new(RecordingSink {
        log: log.clone(),
        ..Default::default()
    });
    let remote = Arc::new(RecordingRemote {
        log: log.clone(),
        ..Default::default()
    });
    let subsystem = |name| {
        Box::new(RecordingSubsystem {
            name,
            log: log.clone(),
        }) as Box<dyn Subsystem>
    };

    let (tx, rx, closer) = queue::bounded(4);
    let consumer = tokio::spawn(FanOut::new(storage.clone(), Some(remote.clone())).run(rx));

    // Buffered before shutdown; must still reach both sinks
    tx.enqueue(batch(&[1.0])).await.unwrap();

    let subsystems = Subsystems {
        target_manager: subsystem("targets"),
        rule_manager: subsystem("rules"),
        storage_tasks: vec![subsystem("retention")],
        storage: storage.clone(),
        remote: Some(remote.clone()),
        notifications: subsystem("notifications"),
    };
    let (coordinator, handle) =
        ShutdownCoordinator::new(subsystems, closer, Duration::ZERO, GracePolicy::Fixed);
    let coordinator = tokio::spawn(coordinator.run());

    handle.trigger(ShutdownTrigger::Interrupt);
    drop(tx);
    let report = coordinator.await.unwrap();
    let stats = consumer.await.unwrap();

    assert_eq!(report.trigger, ShutdownTrigger::Interrupt);
    assert_eq!(stats.batches_forwarded, 1);

    let order = [
        "targets.stop",
        "rules.stop",
        "retention.stop",
        "storage.close",
        "remote.close",
        "notifications.stop",
    ];
    for pair in order.windows(2) {
        assert!(
            log.position(pair[0]) < log.position(pair[1]),
            "{} must happen before {}: {:?}",
            pair[0],
            pair[1],
            log.events()
        );
    }
    assert!(log.position("storage.append") < log.position("storage.close"));
    assert!(log.position("remote.enqueue") < log.position("remote.close"));
    assert_eq!(log.count("storage.close"), 1);
    assert_eq!(handle.state(), ShutdownState::Stopped);
}
