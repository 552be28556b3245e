//! Test lifecycle: starts, deferred starts, cancellation, restarts and recovery.
//!
//! The orchestrator owns the registry of live tasks. An entry exists for every
//! test with a running generation task or an armed schedule timer, and the
//! registry lock is only held for map mutations.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::Configuration;
use common::{
    CoreError, CoreResult, NewTest, RestartOverrides, SignalCounts, StoreError, StoreResult, Test,
    TestFilter, TestId, TestStatus, TestStore, TestUpdate,
};
use delivery::DeliveryWorkerPool;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::generator::{GenerationOutcome, SignalGenerator};

/// What a live registry entry is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// A timer waiting for the scheduled start time
    Scheduled,
    /// A generation run
    Running,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Scheduled => "scheduled",
            TaskKind::Running => "running",
        }
    }
}

struct TestTask {
    run_id: u64,
    kind: TaskKind,
    token: CancellationToken,
    /// Cancelled by the task itself when it exits
    finished: CancellationToken,
}

/// Handles handed to a task when its registry entry is created.
///
/// Dropping it marks the task as finished.
struct Reservation {
    run_id: u64,
    token: CancellationToken,
    finished: CancellationToken,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.finished.cancel();
    }
}

/// What `recover` did with the persisted tests
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Running tests without a task, moved to error
    pub interrupted: usize,
    /// Scheduled tests whose timers were armed again
    pub rearmed: usize,
    /// Scheduled tests whose start time passed while nothing was running
    pub expired: usize,
}

struct Inner {
    store: Arc<dyn TestStore>,
    pool: Arc<DeliveryWorkerPool>,
    generator: SignalGenerator,
    registry: Mutex<HashMap<TestId, TestTask>>,
    tasks: TaskTracker,
    next_run_id: AtomicU64,
    store_timeout: Duration,
    cancel_timeout: Duration,
}

/// Owns the lifecycle of every test in the process
#[derive(Clone)]
pub struct TestOrchestrator {
    inner: Arc<Inner>,
}

impl TestOrchestrator {
    pub fn new(
        store: Arc<dyn TestStore>,
        pool: Arc<DeliveryWorkerPool>,
        config: &Configuration,
    ) -> Self {
        let generator = SignalGenerator::new(config.generator.clone(), pool.clone());
        Self {
            inner: Arc::new(Inner {
                store,
                pool,
                generator,
                registry: Mutex::new(HashMap::new()),
                tasks: TaskTracker::new(),
                next_run_id: AtomicU64::new(1),
                store_timeout: config.store.timeout,
                cancel_timeout: config.orchestrator.cancel_timeout,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<DeliveryWorkerPool> {
        &self.inner.pool
    }

    /// Validate and persist a new pending test
    pub async fn create_test(&self, new_test: NewTest) -> CoreResult<Test> {
        new_test.validate().map_err(CoreError::Validation)?;

        let mut test = new_test.into_test();
        let id = self.store_call(self.inner.store.insert(&test)).await?;
        test.id = Some(id.clone());

        tracing::info!(test_id = %id, owner = %test.owner, "Created test");
        Ok(test)
    }

    /// Start generating for a test right away.
    ///
    /// A test without id, or with an id the store does not know, is persisted as
    /// running. A stored test must be pending or scheduled. Fails with a state
    /// conflict while the test has a live generation task.
    pub async fn start_test(&self, mut test: Test) -> CoreResult<TestId> {
        let id = match &test.id {
            Some(id) => id.clone(),
            None => {
                let id = TestId::new();
                test.id = Some(id.clone());
                id
            }
        };

        match self.find(&id).await? {
            Some(stored) => {
                if !stored.status.is_startable() {
                    return Err(CoreError::conflict(&id, stored.status, "start"));
                }
                self.launch(stored, TestUpdate::default(), "start").await
            }
            None => self.launch_new(test).await,
        }
    }

    /// Defer the start of a pending or scheduled test until `at`.
    ///
    /// Scheduling an already scheduled test replaces its timer.
    pub async fn schedule_test(&self, id: &TestId, at: DateTime<Utc>) -> CoreResult<()> {
        if at <= Utc::now() {
            return Err(CoreError::validation("at", "must be in the future"));
        }

        let test = self.load(id).await?;
        if !matches!(test.status, TestStatus::Pending | TestStatus::Scheduled) {
            return Err(CoreError::conflict(id, test.status, "schedule"));
        }
        if self.live_kind(id) == Some(TaskKind::Running) {
            return Err(CoreError::conflict(id, TestStatus::Running, "schedule"));
        }

        let update = TestUpdate {
            status: Some(TestStatus::Scheduled),
            scheduled_time: Some(Some(at)),
            ..Default::default()
        };
        self.store_call(self.inner.store.update_fields(id, &update))
            .await?;

        self.arm_timer(id, at)?;
        tracing::info!(test_id = %id, at = %at, "Scheduled test");
        Ok(())
    }

    /// Stop a running or scheduled test.
    ///
    /// For a running test this returns once the run has written its terminal
    /// status, or after the configured cancel timeout.
    pub async fn cancel_test(&self, id: &TestId) -> CoreResult<()> {
        let live = {
            let mut registry = self.registry();
            match registry.get(id).map(|task| task.kind) {
                Some(TaskKind::Running) => registry
                    .get(id)
                    .map(|task| (TaskKind::Running, task.token.clone(), task.finished.clone())),
                Some(TaskKind::Scheduled) => registry
                    .remove(id)
                    .map(|task| (TaskKind::Scheduled, task.token, task.finished)),
                None => None,
            }
        };

        let Some((kind, token, finished)) = live else {
            return self.cancel_persisted(id).await;
        };

        token.cancel();
        let stopped = tokio::time::timeout(self.inner.cancel_timeout, finished.cancelled())
            .await
            .is_ok();
        if !stopped {
            tracing::warn!(
                test_id = %id,
                timeout = ?self.inner.cancel_timeout,
                "Task did not stop within the cancel timeout"
            );
        }

        match kind {
            TaskKind::Running => {
                // the run may have written its terminal status before the token fired
                let status = self.load(id).await?.status;
                match status {
                    TestStatus::Cancelled => {
                        tracing::info!(test_id = %id, "Cancelled running test");
                        Ok(())
                    }
                    TestStatus::Running if !stopped => Ok(()),
                    other => Err(CoreError::conflict(id, other, "cancel")),
                }
            }
            TaskKind::Scheduled => {
                tracing::info!(test_id = %id, "Cancelled scheduled start");
                self.cancel_persisted(id).await
            }
        }
    }

    /// Apply overrides to a finished test and run it again
    pub async fn restart_test(
        &self,
        id: &TestId,
        overrides: RestartOverrides,
    ) -> CoreResult<TestId> {
        overrides.validate().map_err(CoreError::Validation)?;

        let test = self.load(id).await?;
        if !test.status.is_restartable() {
            return Err(CoreError::conflict(id, test.status, "restart"));
        }

        tracing::info!(test_id = %id, previous = %test.status, "Restarting test");
        self.launch(test, overrides.to_update(), "restart").await
    }

    /// Mark the results of a completed or failed test as saved
    pub async fn save_results(&self, id: &TestId) -> CoreResult<Test> {
        let test = self.load(id).await?;
        if !test.status.can_transition_to(TestStatus::ResultsSaved) {
            return Err(CoreError::conflict(id, test.status, "save results of"));
        }

        self.store_call(
            self.inner
                .store
                .update_fields(id, &TestUpdate::status(TestStatus::ResultsSaved)),
        )
        .await?;
        self.load(id).await
    }

    pub async fn get_all_tests(&self, filter: &TestFilter) -> CoreResult<Vec<Test>> {
        Ok(self.store_call(self.inner.store.find_all(filter)).await?)
    }

    pub async fn get_test_by_id(&self, id: &TestId) -> CoreResult<Test> {
        self.load(id).await
    }

    /// Tests with a live task, sorted by id
    pub fn live_tasks(&self) -> Vec<(TestId, TaskKind)> {
        let mut live: Vec<_> = self
            .registry()
            .iter()
            .map(|(id, task)| (id.clone(), task.kind))
            .collect();
        live.sort_by(|a, b| a.0.cmp(&b.0));
        live
    }

    /// Wait until the current task of a test (if any) has exited
    pub async fn wait_for(&self, id: &TestId) {
        let finished = self.registry().get(id).map(|task| task.finished.clone());
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    /// Reconcile persisted tests with the empty registry of a fresh process
    pub async fn recover(&self) -> CoreResult<RecoverySummary> {
        let mut summary = RecoverySummary::default();

        let running = self
            .get_all_tests(&TestFilter::with_status(TestStatus::Running))
            .await?;
        for test in running {
            let Some(id) = test.id else { continue };
            if self.live_kind(&id).is_some() {
                continue;
            }
            let update = TestUpdate {
                status: Some(TestStatus::Error),
                completed_at: Some(Some(Utc::now())),
                ..Default::default()
            };
            match self
                .store_call(self.inner.store.update_fields(&id, &update))
                .await
            {
                Ok(()) => {
                    tracing::warn!(test_id = %id, "Marked interrupted test as error");
                    summary.interrupted += 1;
                }
                Err(e) => {
                    tracing::error!(test_id = %id, error = %e, "Failed to mark interrupted test")
                }
            }
        }

        let scheduled = self
            .get_all_tests(&TestFilter::with_status(TestStatus::Scheduled))
            .await?;
        let now = Utc::now();
        for test in scheduled {
            let Some(id) = test.id else { continue };
            if self.live_kind(&id).is_some() {
                continue;
            }
            match test.scheduled_time {
                Some(at) if at > now => {
                    self.arm_timer(&id, at)?;
                    summary.rearmed += 1;
                }
                _ => {
                    let update = TestUpdate {
                        status: Some(TestStatus::Cancelled),
                        scheduled_time: Some(None),
                        ..Default::default()
                    };
                    match self
                        .store_call(self.inner.store.update_fields(&id, &update))
                        .await
                    {
                        Ok(()) => {
                            tracing::warn!(
                                test_id = %id,
                                "Scheduled start passed while stopped, cancelled test"
                            );
                            summary.expired += 1;
                        }
                        Err(e) => tracing::error!(
                            test_id = %id,
                            error = %e,
                            "Failed to cancel expired schedule"
                        ),
                    }
                }
            }
        }

        tracing::info!(
            interrupted = summary.interrupted,
            rearmed = summary.rearmed,
            expired = summary.expired,
            "Recovered persisted tests"
        );
        Ok(summary)
    }

    /// Cancel every live task, wait for them to exit and stop the delivery pool.
    ///
    /// Scheduled tests keep their persisted status so `recover` can re-arm them.
    pub async fn shutdown(&self) {
        let tokens: Vec<_> = self
            .registry()
            .values()
            .map(|task| task.token.clone())
            .collect();
        tracing::info!(live = tokens.len(), "Shutting down orchestrator");
        for token in tokens {
            token.cancel();
        }

        self.inner.tasks.close();
        if tokio::time::timeout(self.inner.cancel_timeout, self.inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                remaining = self.inner.tasks.len(),
                "Tasks still running after shutdown timeout"
            );
        }

        self.inner.pool.shutdown().await;
    }

    async fn launch_new(&self, mut test: Test) -> CoreResult<TestId> {
        let id = test.id.clone().unwrap_or_default();
        let reservation = self.reserve(&id, TaskKind::Running)?;

        let now = Utc::now();
        test.status = TestStatus::Running;
        test.scheduled_time = None;
        test.completed_at = None;
        test.emitted = SignalCounts::default();
        test.run_count = 1;
        test.updated_at = now;

        if let Err(e) = self.store_call(self.inner.store.insert(&test)).await {
            self.deregister(&id, reservation.run_id);
            return Err(e.into());
        }

        self.spawn_run(id, test, reservation).await
    }

    async fn launch(
        &self,
        test: Test,
        update: TestUpdate,
        operation: &'static str,
    ) -> CoreResult<TestId> {
        let id = test.id.clone().unwrap_or_default();
        if !test.status.can_transition_to(TestStatus::Running) {
            return Err(CoreError::conflict(&id, test.status, operation));
        }
        let reservation = self.reserve(&id, TaskKind::Running)?;
        self.launch_reserved(id, test, update, reservation).await
    }

    async fn launch_reserved(
        &self,
        id: TestId,
        mut test: Test,
        mut update: TestUpdate,
        reservation: Reservation,
    ) -> CoreResult<TestId> {
        update.status = Some(TestStatus::Running);
        update.scheduled_time = Some(None);
        update.completed_at = Some(None);
        update.emitted = Some(SignalCounts::default());
        update.run_count = Some(test.run_count.saturating_add(1));

        if let Err(e) = self
            .store_call(self.inner.store.update_fields(&id, &update))
            .await
        {
            self.deregister(&id, reservation.run_id);
            return Err(e.into());
        }
        test.apply(&update);

        self.spawn_run(id, test, reservation).await
    }

    /// Open the destinations and hand the test to a generation task
    async fn spawn_run(
        &self,
        id: TestId,
        test: Test,
        reservation: Reservation,
    ) -> CoreResult<TestId> {
        if let Err(e) = self
            .inner
            .pool
            .register_destinations(&id, &test.destinations)
            .await
        {
            tracing::error!(test_id = %id, error = %e, "Failed to open destinations");
            let update = TestUpdate {
                status: Some(TestStatus::Error),
                completed_at: Some(Some(Utc::now())),
                ..Default::default()
            };
            if let Err(store_err) = self
                .store_call(self.inner.store.update_fields(&id, &update))
                .await
            {
                tracing::error!(
                    test_id = %id,
                    error = %store_err,
                    "Failed to persist error status"
                );
            }
            self.deregister(&id, reservation.run_id);
            return Err(CoreError::Unexpected(format!(
                "failed to open destinations: {e}"
            )));
        }

        tracing::info!(
            test_id = %id,
            run = test.run_count,
            duration_secs = test.duration_secs,
            log_rate = ?test.rate(common::SignalType::Logs),
            metrics_rate = ?test.rate(common::SignalType::Metrics),
            trace_rate = ?test.rate(common::SignalType::Traces),
            "Started test"
        );

        let orchestrator = self.clone();
        let task_id = id.clone();
        self.inner.tasks.spawn(async move {
            orchestrator.run(task_id, test, reservation).await;
        });
        Ok(id)
    }

    async fn run(self, id: TestId, test: Test, reservation: Reservation) {
        let token = reservation.token.clone();

        let report = self.inner.generator.run(&id, &test, token.clone()).await;
        // queued records reach the sinks before the test counts as finished
        self.inner.pool.release_destinations(&id).await;

        let status = match report.outcome {
            GenerationOutcome::Elapsed if token.is_cancelled() => TestStatus::Cancelled,
            GenerationOutcome::Elapsed => TestStatus::Completed,
            GenerationOutcome::Cancelled => TestStatus::Cancelled,
            GenerationOutcome::Failed(e) => {
                tracing::error!(test_id = %id, error = %e, "Generation failed");
                TestStatus::Error
            }
        };

        self.finish(&id, status, report.emitted).await;
        self.deregister(&id, reservation.run_id);
    }

    /// Persist the terminal status of a run.
    ///
    /// Transitions the table rejects (a status already written) are skipped, so a
    /// repeated completion never writes twice. Store failures are logged and one
    /// attempt is made to record `error`; nothing retries beyond that.
    async fn finish(&self, id: &TestId, status: TestStatus, emitted: SignalCounts) {
        let update = TestUpdate {
            status: Some(status),
            completed_at: Some(Some(Utc::now())),
            emitted: Some(emitted),
            ..Default::default()
        };

        let result = match self.find(id).await {
            Ok(Some(test)) if !test.status.can_transition_to(status) => {
                tracing::debug!(
                    test_id = %id,
                    current = %test.status,
                    next = %status,
                    "Terminal status already written"
                );
                return;
            }
            Ok(Some(_)) => {
                self.store_call(self.inner.store.update_fields(id, &update))
                    .await
            }
            Ok(None) => Err(StoreError::NotFound(id.clone())),
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => tracing::info!(
                test_id = %id,
                status = %status,
                logs = emitted.logs,
                metrics = emitted.metrics,
                traces = emitted.traces,
                "Test finished"
            ),
            Err(e) if status == TestStatus::Error => {
                tracing::error!(
                    test_id = %id,
                    status = %status,
                    error = %e,
                    "Failed to persist terminal status"
                );
            }
            Err(e) => {
                tracing::error!(
                    test_id = %id,
                    status = %status,
                    error = %e,
                    "Failed to persist terminal status, recording error"
                );
                let fallback = TestUpdate {
                    status: Some(TestStatus::Error),
                    ..update
                };
                if let Err(e) = self
                    .store_call(self.inner.store.update_fields(id, &fallback))
                    .await
                {
                    tracing::error!(test_id = %id, error = %e, "Failed to persist error status");
                }
            }
        }
    }

    /// Flip a test without a live task to cancelled
    async fn cancel_persisted(&self, id: &TestId) -> CoreResult<()> {
        let test = self.load(id).await?;
        if !test.status.can_transition_to(TestStatus::Cancelled) {
            return Err(CoreError::conflict(id, test.status, "cancel"));
        }

        let update = TestUpdate {
            status: Some(TestStatus::Cancelled),
            scheduled_time: Some(None),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        };
        self.store_call(self.inner.store.update_fields(id, &update))
            .await?;
        tracing::info!(test_id = %id, previous = %test.status, "Cancelled test");
        Ok(())
    }

    fn arm_timer(&self, id: &TestId, at: DateTime<Utc>) -> CoreResult<()> {
        let reservation = self.reserve(id, TaskKind::Scheduled)?;
        let orchestrator = self.clone();
        let id = id.clone();
        self.inner.tasks.spawn(async move {
            orchestrator.await_schedule(id, at, reservation).await;
        });
        Ok(())
    }

    async fn await_schedule(self, id: TestId, at: DateTime<Utc>, reservation: Reservation) {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = reservation.token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        // from here on a cancel targets the run this timer is about to start
        if !self.promote(&id, reservation.run_id) {
            return;
        }

        let test = match self.load(&id).await {
            Ok(test) if test.status == TestStatus::Scheduled => test,
            Ok(test) => {
                tracing::info!(test_id = %id, status = %test.status, "Skipping scheduled start");
                self.deregister(&id, reservation.run_id);
                return;
            }
            Err(e) => {
                tracing::error!(test_id = %id, error = %e, "Scheduled start could not read test");
                self.deregister(&id, reservation.run_id);
                return;
            }
        };

        if reservation.token.is_cancelled() {
            tracing::info!(test_id = %id, "Scheduled start cancelled as it fired");
            if let Err(e) = self.cancel_persisted(&id).await {
                tracing::error!(test_id = %id, error = %e, "Failed to cancel scheduled start");
            }
            self.deregister(&id, reservation.run_id);
            return;
        }

        tracing::info!(test_id = %id, "Scheduled start time reached");
        if let Err(e) = self
            .launch_reserved(id.clone(), test, TestUpdate::default(), reservation)
            .await
        {
            tracing::error!(test_id = %id, error = %e, "Scheduled start failed");
        }
    }

    /// Register a task for `id`.
    ///
    /// A live run is never replaced. A pending timer is cancelled and replaced.
    fn reserve(&self, id: &TestId, kind: TaskKind) -> CoreResult<Reservation> {
        let reservation = Reservation {
            run_id: self.inner.next_run_id.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
            finished: CancellationToken::new(),
        };

        let mut registry = self.registry();
        if let Some(existing) = registry.get(id) {
            match existing.kind {
                TaskKind::Running => {
                    return Err(CoreError::conflict(id, TestStatus::Running, "start"));
                }
                TaskKind::Scheduled => existing.token.cancel(),
            }
        }
        registry.insert(
            id.clone(),
            TestTask {
                run_id: reservation.run_id,
                kind,
                token: reservation.token.clone(),
                finished: reservation.finished.clone(),
            },
        );
        Ok(reservation)
    }

    /// Remove the entry for `id` if it still belongs to `run_id`
    fn deregister(&self, id: &TestId, run_id: u64) -> bool {
        let mut registry = self.registry();
        if registry.get(id).is_some_and(|task| task.run_id == run_id) {
            registry.remove(id);
            true
        } else {
            false
        }
    }

    /// Turn the timer entry `run_id` into a run entry; false when it was replaced
    fn promote(&self, id: &TestId, run_id: u64) -> bool {
        match self.registry().get_mut(id) {
            Some(task) if task.run_id == run_id => {
                task.kind = TaskKind::Running;
                true
            }
            _ => false,
        }
    }

    fn live_kind(&self, id: &TestId) -> Option<TaskKind> {
        self.registry().get(id).map(|task| task.kind)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TestId, TestTask>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn find(&self, id: &TestId) -> StoreResult<Option<Test>> {
        self.store_call(self.inner.store.find_by_id(id)).await
    }

    async fn load(&self, id: &TestId) -> CoreResult<Test> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.clone()))
    }

    /// Bound a store call by the configured store timeout
    async fn store_call<T>(&self, call: impl Future<Output = StoreResult<T>>) -> StoreResult<T> {
        let timeout = self.inner.store_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(StoreError::Timeout(timeout)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::store::InMemoryTestStore;
    use common::{Destination, FieldError};

    fn orchestrator() -> (TestOrchestrator, Arc<InMemoryTestStore>) {
        let config = Configuration::default();
        let store = Arc::new(InMemoryTestStore::new());
        let pool = Arc::new(DeliveryWorkerPool::start(&config.delivery).unwrap());
        (TestOrchestrator::new(store.clone(), pool, &config), store)
    }

    fn new_test(dir: &tempfile::TempDir, duration_secs: u64) -> NewTest {
        NewTest {
            owner: "orchestrator".to_string(),
            log_rate: Some(10.0),
            metrics_rate: None,
            trace_rate: None,
            log_size: 32,
            duration_secs,
            destinations: vec![Destination::file(dir.path().join("out"))],
        }
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_payload() {
        let (orchestrator, _) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let mut payload = new_test(&dir, 1);
        payload.duration_secs = 0;

        let err = orchestrator.create_test(payload).await.unwrap_err();
        let expected = vec![FieldError::new("duration_secs", "must be greater than 0")];
        assert!(matches!(err, CoreError::Validation(ref fields) if *fields == expected));
    }

    #[tokio::test]
    async fn test_schedule_in_the_past_is_rejected_without_timer() {
        let (orchestrator, _) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let test = orchestrator.create_test(new_test(&dir, 1)).await.unwrap();
        let id = test.id.unwrap();

        let err = orchestrator
            .schedule_test(&id, Utc::now() - chrono::Duration::seconds(5))
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Validation(_)));
        assert!(orchestrator.live_tasks().is_empty());
        let stored = orchestrator.get_test_by_id(&id).await.unwrap();
        assert_eq!(stored.status, TestStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_scheduled_test_before_it_fires() {
        let (orchestrator, _) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let id = orchestrator
            .create_test(new_test(&dir, 1))
            .await
            .unwrap()
            .id
            .unwrap();

        orchestrator
            .schedule_test(&id, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(orchestrator.live_tasks(), vec![(id.clone(), TaskKind::Scheduled)]);

        orchestrator.cancel_test(&id).await.unwrap();

        assert!(orchestrator.live_tasks().is_empty());
        let stored = orchestrator.get_test_by_id(&id).await.unwrap();
        assert_eq!(stored.status, TestStatus::Cancelled);
        assert_eq!(stored.scheduled_time, None);
    }

    #[tokio::test]
    async fn test_reschedule_replaces_timer() {
        let (orchestrator, _) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let id = orchestrator
            .create_test(new_test(&dir, 1))
            .await
            .unwrap()
            .id
            .unwrap();

        let later = Utc::now() + chrono::Duration::seconds(120);
        orchestrator
            .schedule_test(&id, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        orchestrator.schedule_test(&id, later).await.unwrap();

        assert_eq!(orchestrator.live_tasks().len(), 1);
        let stored = orchestrator.get_test_by_id(&id).await.unwrap();
        assert_eq!(stored.status, TestStatus::Scheduled);
        assert_eq!(stored.scheduled_time, Some(later));
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_test() {
        let (orchestrator, _) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let id = orchestrator
            .create_test(new_test(&dir, 1))
            .await
            .unwrap()
            .id
            .unwrap();

        orchestrator.cancel_test(&id).await.unwrap();
        let err = orchestrator.cancel_test(&id).await.unwrap_err();

        assert!(matches!(
            err,
            CoreError::StateConflict { status: TestStatus::Cancelled, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_test_is_not_found() {
        let (orchestrator, _) = orchestrator();
        let id = TestId::new();

        assert!(matches!(
            orchestrator.cancel_test(&id).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.get_test_by_id(&id).await,
            Err(CoreError::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.restart_test(&id, RestartOverrides::default()).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_save_results_requires_finished_run() {
        let (orchestrator, store) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        let id = orchestrator
            .create_test(new_test(&dir, 1))
            .await
            .unwrap()
            .id
            .unwrap();

        let err = orchestrator.save_results(&id).await.unwrap_err();
        assert!(matches!(err, CoreError::StateConflict { .. }));

        store
            .update_fields(&id, &TestUpdate::status(TestStatus::Completed))
            .await
            .unwrap();
        let saved = orchestrator.save_results(&id).await.unwrap();
        assert_eq!(saved.status, TestStatus::ResultsSaved);
    }

    #[tokio::test]
    async fn test_unopenable_destination_moves_test_to_error() {
        let (orchestrator, _) = orchestrator();
        let dir = tempfile::tempdir().unwrap();
        // a regular file cannot be used as a parent directory
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let mut payload = new_test(&dir, 1);
        payload.destinations = vec![Destination::file(blocker.join("out"))];
        let test = orchestrator.create_test(payload).await.unwrap();
        let id = test.id.clone().unwrap();

        let err = orchestrator.start_test(test).await.unwrap_err();

        assert!(matches!(err, CoreError::Unexpected(_)));
        assert!(orchestrator.live_tasks().is_empty());
        let stored = orchestrator.get_test_by_id(&id).await.unwrap();
        assert_eq!(stored.status, TestStatus::Error);
    }

    #[tokio::test]
    async fn test_recover_reconciles_orphaned_tests() {
        let (orchestrator, store) = orchestrator();
        let dir = tempfile::tempdir().unwrap();

        let mut running = new_test(&dir, 1).into_test();
        running.status = TestStatus::Running;
        let running_id = store.insert(&running).await.unwrap();

        let mut future = new_test(&dir, 1).into_test();
        future.status = TestStatus::Scheduled;
        future.scheduled_time = Some(Utc::now() + chrono::Duration::seconds(300));
        let future_id = store.insert(&future).await.unwrap();

        let mut expired = new_test(&dir, 1).into_test();
        expired.status = TestStatus::Scheduled;
        expired.scheduled_time = Some(Utc::now() - chrono::Duration::seconds(300));
        let expired_id = store.insert(&expired).await.unwrap();

        let summary = orchestrator.recover().await.unwrap();

        assert_eq!(
            summary,
            RecoverySummary {
                interrupted: 1,
                rearmed: 1,
                expired: 1
            }
        );
        let status = |id: TestId| {
            let orchestrator = orchestrator.clone();
            async move { orchestrator.get_test_by_id(&id).await.unwrap().status }
        };
        assert_eq!(status(running_id).await, TestStatus::Error);
        assert_eq!(status(future_id.clone()).await, TestStatus::Scheduled);
        assert_eq!(status(expired_id).await, TestStatus::Cancelled);
        assert_eq!(orchestrator.live_tasks(), vec![(future_id, TaskKind::Scheduled)]);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn test_store_timeout_surfaces_as_persistence_failure() {
        struct StalledStore;

        #[async_trait::async_trait]
        impl TestStore for StalledStore {
            async fn insert(&self, _test: &Test) -> StoreResult<TestId> {
                std::future::pending().await
            }
            async fn find_by_id(&self, _id: &TestId) -> StoreResult<Option<Test>> {
                std::future::pending().await
            }
            async fn update_fields(&self, _id: &TestId, _update: &TestUpdate) -> StoreResult<()> {
                std::future::pending().await
            }
            async fn find_all(&self, _filter: &TestFilter) -> StoreResult<Vec<Test>> {
                std::future::pending().await
            }
        }

        let mut config = Configuration::default();
        config.store.timeout = Duration::from_millis(20);
        let pool = Arc::new(DeliveryWorkerPool::start(&config.delivery).unwrap());
        let orchestrator = TestOrchestrator::new(Arc::new(StalledStore), pool, &config);

        let err = orchestrator.get_test_by_id(&TestId::new()).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::Persistence(StoreError::Timeout(_))
        ));
        assert_eq!(err.kind(), "persistence_failure");
    }
}
