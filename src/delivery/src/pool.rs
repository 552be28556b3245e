//! Bounded, lossy delivery queue drained by a fixed set of workers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use common::config::{DeliveryConfig, RetryConfig};
use common::{Destination, Record, TestId};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::retry::deliver_with_retry;
use crate::sink::{DefaultSinkFactory, SinkClient, SinkFactory};
use crate::stats::DeliveryStats;
use crate::{DeliveryError, DeliveryResult};

/// Sinks of one test plus the number of its records still queued or in flight
struct TestRoute {
    sinks: Vec<Arc<dyn SinkClient>>,
    pending: AtomicUsize,
    drained: Notify,
}

impl TestRoute {
    fn new(sinks: Vec<Arc<dyn SinkClient>>) -> Self {
        Self {
            sinks,
            pending: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    async fn close(&self, test_id: &TestId) {
        for sink in &self.sinks {
            if let Err(e) = sink.close().await {
                tracing::warn!(
                    test_id = %test_id,
                    sink = %sink.describe(),
                    error = %e,
                    "Failed to close sink"
                );
            }
        }
    }
}

struct Envelope {
    record: Record,
    route: Arc<TestRoute>,
}

struct PoolShared {
    routes: RwLock<HashMap<TestId, Arc<TestRoute>>>,
    factory: Arc<dyn SinkFactory>,
    retry: RetryConfig,
    stats: DeliveryStats,
}

impl PoolShared {
    fn route(&self, test_id: &TestId) -> Option<Arc<TestRoute>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(test_id)
            .cloned()
    }

    fn take_route(&self, test_id: &TestId) -> Option<Arc<TestRoute>> {
        self.routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(test_id)
    }

    async fn dispatch(&self, envelope: Envelope) {
        let Envelope { record, route } = envelope;
        let deliveries = route
            .sinks
            .iter()
            .map(|sink| self.deliver(sink.as_ref(), &record));
        futures::future::join_all(deliveries).await;
        route.finish_one();
    }

    async fn deliver(&self, sink: &dyn SinkClient, record: &Record) {
        match deliver_with_retry(sink, record, &self.retry, &self.stats).await {
            Ok(_) => self.stats.record_delivered(),
            Err(e) => {
                self.stats.record_failed();
                tracing::warn!(
                    test_id = %record.test_id(),
                    signal = %record.signal_type(),
                    sink = %sink.describe(),
                    error = %e,
                    "Dropping record after failed delivery"
                );
            }
        }
    }
}

/// Fixed worker pool fanning records out to every destination of their test.
///
/// `submit` never blocks: when the queue is full the record is dropped and counted.
/// Delivery is best effort; callers must not assume a submitted record arrives.
pub struct DeliveryWorkerPool {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<PoolShared>,
    drain_timeout: Duration,
}

impl DeliveryWorkerPool {
    /// Start a pool opening sinks with the default file/HTTP factory
    pub fn start(config: &DeliveryConfig) -> DeliveryResult<Self> {
        let factory = DefaultSinkFactory::new(config)?;
        Ok(Self::with_factory(config, Arc::new(factory)))
    }

    pub fn with_factory(config: &DeliveryConfig, factory: Arc<dyn SinkFactory>) -> Self {
        let workers = config.workers.max(1);
        let (sender, receiver) = mpsc::channel(config.queue_capacity().max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let shared = Arc::new(PoolShared {
            routes: RwLock::new(HashMap::new()),
            factory,
            retry: config.retry.clone(),
            stats: DeliveryStats::new(),
        });

        let handles = (0..workers)
            .map(|worker_id| {
                let receiver = receiver.clone();
                let shared = shared.clone();
                tokio::spawn(async move {
                    loop {
                        let next = { receiver.lock().await.recv().await };
                        match next {
                            Some(envelope) => shared.dispatch(envelope).await,
                            None => break,
                        }
                    }
                    tracing::debug!(worker_id, "Delivery worker stopped");
                })
            })
            .collect();

        log::info!(
            "Delivery pool started with {} workers and queue capacity {}",
            workers,
            config.queue_capacity()
        );

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            shared,
            drain_timeout: drain_timeout(config),
        }
    }

    /// Queue a record without waiting.
    ///
    /// Records of a test without registered destinations are counted as unroutable
    /// and discarded. Fails with `QueueFull` (record dropped) or `Closed`.
    pub fn submit(&self, record: Record) -> DeliveryResult<()> {
        let Some(sender) = self.sender() else {
            self.shared.stats.record_dropped();
            return Err(DeliveryError::Closed);
        };

        let Some(route) = self.shared.route(record.test_id()) else {
            self.shared.stats.record_unroutable();
            tracing::debug!(
                test_id = %record.test_id(),
                "No destinations registered, discarding record"
            );
            return Ok(());
        };

        route.pending.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(Envelope {
            record,
            route: route.clone(),
        }) {
            Ok(()) => {
                self.shared.stats.record_submitted();
                Ok(())
            }
            Err(e) => {
                route.finish_one();
                self.shared.stats.record_dropped();
                match e {
                    mpsc::error::TrySendError::Full(envelope) => {
                        tracing::debug!(
                            test_id = %envelope.record.test_id(),
                            "Delivery queue full, dropping record"
                        );
                        Err(DeliveryError::QueueFull)
                    }
                    mpsc::error::TrySendError::Closed(_) => Err(DeliveryError::Closed),
                }
            }
        }
    }

    /// Open the sinks for a test's destinations.
    ///
    /// Replaces (and closes) any sinks still registered for the test. When one
    /// destination fails to open, the ones already opened are closed again.
    pub async fn register_destinations(
        &self,
        test_id: &TestId,
        destinations: &[Destination],
    ) -> DeliveryResult<()> {
        let mut sinks: Vec<Arc<dyn SinkClient>> = Vec::with_capacity(destinations.len());
        for destination in destinations {
            match self.shared.factory.open(destination).await {
                Ok(sink) => sinks.push(sink),
                Err(e) => {
                    TestRoute::new(sinks).close(test_id).await;
                    return Err(e);
                }
            }
        }

        tracing::debug!(test_id = %test_id, sinks = sinks.len(), "Registered destinations");
        let previous = self
            .shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(test_id.clone(), Arc::new(TestRoute::new(sinks)));

        if let Some(previous) = previous {
            previous.close(test_id).await;
        }
        Ok(())
    }

    /// Stop routing records of a test, wait (bounded) for its queued records to be
    /// delivered, then close its sinks.
    pub async fn release_destinations(&self, test_id: &TestId) {
        let Some(route) = self.shared.take_route(test_id) else {
            return;
        };

        if tokio::time::timeout(self.drain_timeout, route.wait_drained())
            .await
            .is_err()
        {
            tracing::warn!(
                test_id = %test_id,
                pending = route.pending.load(Ordering::Acquire),
                "Timed out draining records before closing sinks"
            );
        }
        route.close(test_id).await;
        tracing::debug!(test_id = %test_id, "Released destinations");
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.shared.stats
    }

    /// Records currently waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.sender()
            .map(|s| s.max_capacity() - s.capacity())
            .unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.sender().is_none()
    }

    /// Close the queue, let the workers drain it and release every sink.
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(sender) = sender else {
            return;
        };
        drop(sender);

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Delivery worker panicked");
            }
        }

        let routes: Vec<_> = self
            .shared
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (test_id, route) in routes {
            route.close(&test_id).await;
        }

        let stats = self.shared.stats.snapshot();
        tracing::info!(
            submitted = stats.submitted,
            delivered = stats.delivered,
            failed = stats.failed,
            dropped = stats.dropped,
            retries = stats.retries,
            unroutable = stats.unroutable,
            "Delivery pool shut down"
        );
    }

    fn sender(&self) -> Option<mpsc::Sender<Envelope>> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Worst case time for one record to exhaust its attempts
fn drain_timeout(config: &DeliveryConfig) -> Duration {
    let attempts = config.retry.max_attempts.max(1);
    let backoff: Duration = (1..=attempts).map(|a| config.retry.backoff_for(a)).sum();
    config.request_timeout * attempts + backoff
}
