//! Synthetic record generation.
//!
//! A [`SignalGenerator`] runs one periodic emitter per enabled signal of a test.
//! Emitters share a cancellation token and a deadline and push records into the
//! delivery pool until either fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::config::GeneratorConfig;
use common::{
    LogLevel, LogRecord, MetricRecord, Record, SignalCounts, SignalType, Test, TestId,
    TraceRecord,
};
use delivery::{DeliveryError, DeliveryWorkerPool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest tick an emitter will use, whatever the configured rate
const MIN_PERIOD: Duration = Duration::from_micros(10);

const WORDS: &[&str] = &[
    "request", "handled", "user", "session", "cache", "miss", "hit", "upstream", "timeout",
    "retry", "queue", "flushed", "shard", "replica", "connection", "opened", "closed", "token",
    "refreshed", "payload", "accepted", "rejected", "latency", "budget", "exceeded",
];

const METRICS: &[(&str, &str)] = &[
    ("cpu.usage", "percent"),
    ("memory.usage", "megabytes"),
    ("http.request.latency", "ms"),
    ("queue.depth", "count"),
];

const OPERATIONS: &[&str] = &[
    "GET /api/orders",
    "POST /api/orders",
    "db.query",
    "cache.get",
    "queue.publish",
];

#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    #[error("delivery pool closed while emitting {0}")]
    PoolClosed(SignalType),
}

/// Why generation stopped
#[derive(Debug)]
pub enum GenerationOutcome {
    /// The test duration elapsed
    Elapsed,
    /// The test's cancellation token fired
    Cancelled,
    /// An emitter failed; all emitters of the test were stopped
    Failed(GeneratorError),
}

#[derive(Debug)]
pub struct GenerationReport {
    pub outcome: GenerationOutcome,
    pub emitted: SignalCounts,
}

/// Builds randomized records for a test
#[derive(Debug, Clone)]
pub struct RecordFactory {
    config: GeneratorConfig,
}

impl RecordFactory {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn build(
        &self,
        signal: SignalType,
        test_id: &TestId,
        log_size: usize,
        rng: &mut impl Rng,
    ) -> Record {
        match signal {
            SignalType::Logs => self.log(test_id, log_size, rng),
            SignalType::Metrics => self.metric(test_id, rng),
            SignalType::Traces => self.trace(test_id, rng),
        }
    }

    fn log(&self, test_id: &TestId, log_size: usize, rng: &mut impl Rng) -> Record {
        let budget = log_size.max(1);
        let target = rng.gen_range(budget.div_ceil(2)..=budget);

        let mut message = String::with_capacity(budget);
        while message.len() < target {
            if !message.is_empty() {
                message.push(' ');
            }
            message.push_str(WORDS[rng.gen_range(0..WORDS.len())]);
        }
        // words are ASCII, so any byte index is a char boundary
        message.truncate(budget);

        Record::Log(LogRecord {
            test_id: test_id.clone(),
            timestamp: Utc::now(),
            level: LogLevel::ALL[rng.gen_range(0..LogLevel::ALL.len())],
            message,
        })
    }

    fn metric(&self, test_id: &TestId, rng: &mut impl Rng) -> Record {
        let (name, unit) = METRICS[rng.gen_range(0..METRICS.len())];
        let jitter = self.config.metric_jitter.abs();

        Record::Metric(MetricRecord {
            test_id: test_id.clone(),
            timestamp: Utc::now(),
            name: name.to_string(),
            value: self.config.metric_base + rng.gen_range(-jitter..=jitter),
            unit: unit.to_string(),
        })
    }

    fn trace(&self, test_id: &TestId, rng: &mut impl Rng) -> Record {
        let min = self.config.trace_min_duration.as_millis() as u64;
        let max = (self.config.trace_max_duration.as_millis() as u64).max(min);

        Record::Trace(TraceRecord {
            test_id: test_id.clone(),
            timestamp: Utc::now(),
            trace_id: format!("{:032x}", rng.r#gen::<u128>()),
            span_id: format!("{:016x}", rng.r#gen::<u64>()),
            operation: OPERATIONS[rng.gen_range(0..OPERATIONS.len())].to_string(),
            duration_ms: rng.gen_range(min..=max),
        })
    }
}

/// Tick period for a rate in records per second
fn tick_period(rate: f64, duration: Duration) -> Duration {
    let ceiling = duration.max(MIN_PERIOD);
    Duration::try_from_secs_f64(1.0 / rate)
        .unwrap_or(ceiling)
        .clamp(MIN_PERIOD, ceiling)
}

enum EmitterStop {
    Deadline,
    Cancelled,
}

struct Emitter {
    signal: SignalType,
    period: Duration,
    test_id: TestId,
    log_size: usize,
    factory: Arc<RecordFactory>,
    pool: Arc<DeliveryWorkerPool>,
}

impl Emitter {
    async fn run(
        self,
        deadline: Instant,
        token: CancellationToken,
    ) -> (SignalType, u64, Result<EmitterStop, GeneratorError>) {
        let mut rng = StdRng::from_entropy();
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let expired = time::sleep_until(deadline);
        tokio::pin!(expired);

        let mut emitted = 0;
        let stop = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break Ok(EmitterStop::Cancelled),
                _ = &mut expired => break Ok(EmitterStop::Deadline),
                _ = ticker.tick() => {
                    if Instant::now() >= deadline {
                        break Ok(EmitterStop::Deadline);
                    }
                    let record = self
                        .factory
                        .build(self.signal, &self.test_id, self.log_size, &mut rng);
                    match self.pool.submit(record) {
                        // a full queue drops the record; generation carries on
                        Ok(()) | Err(DeliveryError::QueueFull) => emitted += 1,
                        Err(_) => break Err(GeneratorError::PoolClosed(self.signal)),
                    }
                }
            }
        };

        (self.signal, emitted, stop)
    }
}

/// Drives the emitters of one test run
#[derive(Clone)]
pub struct SignalGenerator {
    factory: Arc<RecordFactory>,
    pool: Arc<DeliveryWorkerPool>,
}

impl SignalGenerator {
    pub fn new(config: GeneratorConfig, pool: Arc<DeliveryWorkerPool>) -> Self {
        Self {
            factory: Arc::new(RecordFactory::new(config)),
            pool,
        }
    }

    /// Emit records for `test` until its duration elapses or `token` fires.
    ///
    /// Returns after every emitter has exited.
    pub async fn run(
        &self,
        test_id: &TestId,
        test: &Test,
        token: CancellationToken,
    ) -> GenerationReport {
        let duration = test.duration();
        let deadline = Instant::now() + duration;
        // stops the siblings when one emitter fails, without cancelling the test
        let emitters_token = token.child_token();

        let mut emitters = JoinSet::new();
        for signal in SignalType::ALL {
            let Some(rate) = test.rate(signal) else {
                continue;
            };
            let emitter = Emitter {
                signal,
                period: tick_period(rate, duration),
                test_id: test_id.clone(),
                log_size: test.log_size,
                factory: self.factory.clone(),
                pool: self.pool.clone(),
            };
            tracing::debug!(
                test_id = %test_id,
                %signal,
                rate,
                period_us = emitter.period.as_micros() as u64,
                "Starting emitter"
            );
            emitters.spawn(emitter.run(deadline, emitters_token.clone()));
        }

        if emitters.is_empty() {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = time::sleep_until(deadline) => {}
            }
        }

        let mut emitted = SignalCounts::default();
        let mut failure = None;
        let mut cancelled = token.is_cancelled();
        while let Some(joined) = emitters.join_next().await {
            match joined {
                Ok((signal, count, stop)) => {
                    emitted.add(signal, count);
                    match stop {
                        Ok(EmitterStop::Deadline) => {}
                        Ok(EmitterStop::Cancelled) => cancelled = true,
                        Err(e) => {
                            tracing::warn!(
                                test_id = %test_id,
                                %signal,
                                error = %e,
                                "Emitter failed, stopping test"
                            );
                            emitters_token.cancel();
                            failure.get_or_insert(e);
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(test_id = %test_id, error = %e, "Emitter task panicked");
                    emitters_token.cancel();
                }
            }
        }

        let outcome = match failure {
            Some(e) => GenerationOutcome::Failed(e),
            None if cancelled || token.is_cancelled() => GenerationOutcome::Cancelled,
            None => GenerationOutcome::Elapsed,
        };

        GenerationReport { outcome, emitted }
    }
}
