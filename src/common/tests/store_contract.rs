//! Behavior every test store backend must share.
//!
//! The same checks run against the in-memory store and an in-memory SQLite store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::config::StoreConfig;
use common::store::{self, InMemoryTestStore, SqlTestStore};
use common::{
    Destination, NewTest, SignalCounts, StoreError, Test, TestFilter, TestId, TestStatus,
    TestStore, TestUpdate,
};

fn pending_test(owner: &str) -> Test {
    NewTest {
        owner: owner.to_string(),
        log_rate: Some(20.0),
        metrics_rate: None,
        trace_rate: Some(1.0),
        log_size: 100,
        duration_secs: 5,
        destinations: vec![Destination::http("http://collector:4318").with_credential("token")],
    }
    .into_test()
}

async fn backends() -> Vec<(&'static str, Arc<dyn TestStore>)> {
    let sql = SqlTestStore::new("sqlite::memory:")
        .await
        .expect("Failed to open SQLite test store");
    vec![
        ("memory", Arc::new(InMemoryTestStore::new())),
        ("sqlite", Arc::new(sql)),
    ]
}

#[tokio::test]
async fn test_insert_then_find() {
    for (name, store) in backends().await {
        let test = pending_test("team-a");
        let id = store.insert(&test).await.expect("Failed to insert test");

        let found = store
            .find_by_id(&id)
            .await
            .expect("Failed to find test")
            .unwrap_or_else(|| panic!("{name}: inserted test is missing"));
        assert_eq!(found.id.as_ref(), Some(&id), "{name}");
        assert_eq!(found.owner, "team-a", "{name}");
        assert_eq!(found.status, TestStatus::Pending, "{name}");
        assert_eq!(found.log_rate, Some(20.0), "{name}");
        assert_eq!(found.metrics_rate, None, "{name}");
        assert_eq!(found.destinations, test.destinations, "{name}");
    }
}

#[tokio::test]
async fn test_insert_keeps_caller_id() {
    for (name, store) in backends().await {
        let id = TestId::new();
        let mut test = pending_test("team-a");
        test.id = Some(id.clone());

        let assigned = store.insert(&test).await.expect("Failed to insert test");
        assert_eq!(assigned, id, "{name}");
    }
}

#[tokio::test]
async fn test_find_unknown_is_none() {
    for (name, store) in backends().await {
        let found = store
            .find_by_id(&TestId::new())
            .await
            .expect("Failed to query store");
        assert!(found.is_none(), "{name}");
    }
}

#[tokio::test]
async fn test_update_fields_is_partial() {
    for (name, store) in backends().await {
        let id = store
            .insert(&pending_test("team-a"))
            .await
            .expect("Failed to insert test");

        let completed_at = Utc::now();
        let update = TestUpdate {
            status: Some(TestStatus::Completed),
            completed_at: Some(Some(completed_at)),
            emitted: Some(SignalCounts {
                logs: 100,
                metrics: 0,
                traces: 5,
            }),
            run_count: Some(1),
            ..Default::default()
        };
        store
            .update_fields(&id, &update)
            .await
            .expect("Failed to update test");

        let found = store
            .find_by_id(&id)
            .await
            .expect("Failed to find test")
            .expect("Updated test is missing");
        assert_eq!(found.status, TestStatus::Completed, "{name}");
        assert!(found.completed_at.is_some(), "{name}");
        assert_eq!(found.emitted.total(), 105, "{name}");
        assert_eq!(found.run_count, 1, "{name}");
        // untouched fields survive
        assert_eq!(found.trace_rate, Some(1.0), "{name}");
        assert_eq!(found.duration_secs, 5, "{name}");

        store
            .update_fields(
                &id,
                &TestUpdate {
                    completed_at: Some(None),
                    ..Default::default()
                },
            )
            .await
            .expect("Failed to clear completed_at");
        let found = store
            .find_by_id(&id)
            .await
            .expect("Failed to find test")
            .expect("Updated test is missing");
        assert!(found.completed_at.is_none(), "{name}");
        assert_eq!(found.status, TestStatus::Completed, "{name}");
    }
}

#[tokio::test]
async fn test_update_unknown_is_not_found() {
    for (name, store) in backends().await {
        let id = TestId::new();
        let result = store
            .update_fields(&id, &TestUpdate::status(TestStatus::Running))
            .await;
        assert!(
            matches!(result, Err(StoreError::NotFound(ref got)) if *got == id),
            "{name}: {result:?}"
        );
    }
}

#[tokio::test]
async fn test_find_all_filters_and_orders() {
    for (name, store) in backends().await {
        let base = Utc::now();
        let mut ids = Vec::new();
        for (offset, owner) in [(0, "team-a"), (1, "team-b"), (2, "team-a")] {
            let mut test = pending_test(owner);
            test.created_at = base + Duration::seconds(offset);
            test.updated_at = test.created_at;
            ids.push(store.insert(&test).await.expect("Failed to insert test"));
        }
        store
            .update_fields(&ids[2], &TestUpdate::status(TestStatus::Running))
            .await
            .expect("Failed to update test");

        let all = store
            .find_all(&TestFilter::default())
            .await
            .expect("Failed to list tests");
        let all_ids: Vec<_> = all.iter().filter_map(|t| t.id.clone()).collect();
        assert_eq!(all_ids, ids, "{name}: oldest first");

        let team_a = store
            .find_all(&TestFilter {
                owner: Some("team-a".to_string()),
                status: None,
            })
            .await
            .expect("Failed to list tests");
        assert_eq!(team_a.len(), 2, "{name}");

        let running = store
            .find_all(&TestFilter::with_status(TestStatus::Running))
            .await
            .expect("Failed to list tests");
        assert_eq!(running.len(), 1, "{name}");
        assert_eq!(running[0].id.as_ref(), Some(&ids[2]), "{name}");

        let none = store
            .find_all(&TestFilter {
                owner: Some("team-b".to_string()),
                status: Some(TestStatus::Running),
            })
            .await
            .expect("Failed to list tests");
        assert!(none.is_empty(), "{name}");
    }
}

#[tokio::test]
async fn test_sqlite_file_survives_reconnect() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = StoreConfig {
        dsn: format!("sqlite://{}/loadgen.db", dir.path().display()),
        ..Default::default()
    };

    let id = {
        let store = store::connect(&config)
            .await
            .expect("Failed to open SQLite store");
        store
            .insert(&pending_test("team-a"))
            .await
            .expect("Failed to insert test")
    };

    let reopened = store::connect(&config)
        .await
        .expect("Failed to reopen SQLite store");
    let found = reopened
        .find_by_id(&id)
        .await
        .expect("Failed to find test")
        .expect("Test did not survive reconnect");
    assert_eq!(found.owner, "team-a");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sqlite_concurrent_updates_all_succeed() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let dsn = format!("sqlite://{}/concurrent.db", dir.path().display());
    let store = Arc::new(
        SqlTestStore::new(&dsn)
            .await
            .expect("Failed to open SQLite store"),
    );

    let mut ids = Vec::new();
    for _ in 0..40 {
        ids.push(
            store
                .insert(&pending_test("team-a"))
                .await
                .expect("Failed to insert test"),
        );
    }

    let mut updates = tokio::task::JoinSet::new();
    for id in ids.clone() {
        let store = store.clone();
        updates.spawn(async move {
            store
                .update_fields(&id, &TestUpdate::status(TestStatus::Running))
                .await
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = updates.join_next().await {
        if let Err(e) = joined.expect("Update task panicked") {
            failures.push(e.to_string());
        }
    }
    assert!(failures.is_empty(), "failed updates: {failures:?}");

    let running = store
        .find_all(&TestFilter::with_status(TestStatus::Running))
        .await
        .expect("Failed to list tests");
    assert_eq!(running.len(), ids.len());
}
