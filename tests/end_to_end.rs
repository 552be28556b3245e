use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::config::Configuration;
use common::{CoreError, Destination, NewTest, TestStatus};
use delivery::DeliveryWorkerPool;
use orchestrator::TestOrchestrator;

async fn orchestrator(config: &Configuration) -> TestOrchestrator {
    let store = common::store::connect(&config.store).await.unwrap();
    let pool = Arc::new(DeliveryWorkerPool::start(&config.delivery).unwrap());
    TestOrchestrator::new(store, pool, config)
}

fn file_lines(dir: &Path) -> Vec<serde_json::Value> {
    let mut lines = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let content = std::fs::read_to_string(entry.unwrap().path()).unwrap();
        lines.extend(
            content
                .lines()
                .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap()),
        );
    }
    lines
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_log_only_test_writes_file_and_completes() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(&Configuration::default()).await;

    let test = orchestrator
        .create_test(NewTest {
            owner: "e2e".to_string(),
            log_rate: Some(5.0),
            metrics_rate: Some(0.0),
            trace_rate: Some(0.0),
            log_size: 64,
            duration_secs: 1,
            destinations: vec![Destination::file(dir.path().join("records"))],
        })
        .await
        .unwrap();
    let id = orchestrator.start_test(test).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let finished = orchestrator.get_test_by_id(&id).await.unwrap();
    assert_eq!(finished.status, TestStatus::Completed);

    let lines = file_lines(dir.path());
    assert!((4..=6).contains(&lines.len()), "{} lines", lines.len());
    for line in &lines {
        assert_eq!(line["signal"], "log");
        assert_eq!(line["test_id"], id.to_string());
        assert!(line["message"].as_str().unwrap().len() <= 64);
    }

    let stats = orchestrator.pool().stats().snapshot();
    assert_eq!(stats.delivered, lines.len() as u64);
    assert_eq!(stats.failed, 0);
    orchestrator.shutdown().await;
}

#[tokio::test]
#[ntest::timeout(10000)]
async fn test_sqlite_store_recovers_interrupted_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Configuration::default();
    config.store.dsn = format!("sqlite://{}", dir.path().join("loadgen.db").display());

    let first = orchestrator(&config).await;
    let test = first
        .create_test(NewTest {
            owner: "e2e".to_string(),
            log_rate: Some(10.0),
            metrics_rate: Some(2.0),
            trace_rate: Some(2.0),
            log_size: 32,
            duration_secs: 60,
            destinations: vec![Destination::file(dir.path().join("out").join("records"))],
        })
        .await
        .unwrap();
    let id = first.start_test(test).await.unwrap();
    assert_eq!(
        first.get_test_by_id(&id).await.unwrap().status,
        TestStatus::Running
    );

    // a second process sees the run without its task
    let second = orchestrator(&config).await;
    let summary = second.recover().await.unwrap();
    assert_eq!(summary.interrupted, 1);
    assert_eq!(
        second.get_test_by_id(&id).await.unwrap().status,
        TestStatus::Error
    );

    // the first process stops its run and reports the status the store holds
    let err = first.cancel_test(&id).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::StateConflict {
            status: TestStatus::Error,
            ..
        }
    ));
    assert!(first.live_tasks().is_empty());
    assert_eq!(
        first.get_test_by_id(&id).await.unwrap().status,
        TestStatus::Error
    );
    first.shutdown().await;
    second.shutdown().await;
}
