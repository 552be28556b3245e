use common::Record;
use common::config::RetryConfig;

use crate::sink::SinkClient;
use crate::stats::DeliveryStats;
use crate::DeliveryResult;

/// Send `record` to `sink`, retrying with exponential backoff.
///
/// Every failed attempt is followed by its backoff delay (1s, 2s, 4s with the
/// default policy) before the next attempt or, after the last attempt, before the
/// failure is reported. Sinks that do not retry fail on the first error.
/// Returns the number of attempts used on success.
pub async fn deliver_with_retry(
    sink: &dyn SinkClient,
    record: &Record,
    policy: &RetryConfig,
    stats: &DeliveryStats,
) -> DeliveryResult<u32> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match sink.send(record).await {
            Ok(()) => return Ok(attempt),
            Err(e) if !sink.retries() => return Err(e),
            Err(e) => {
                let backoff = policy.backoff_for(attempt);
                tracing::debug!(
                    sink = %sink.describe(),
                    test_id = %record.test_id(),
                    attempt,
                    max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Delivery attempt failed"
                );
                tokio::time::sleep(backoff).await;

                if attempt >= max_attempts {
                    return Err(e);
                }
                stats.record_retry();
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeliveryError;
    use async_trait::async_trait;
    use chrono::Utc;
    use common::{MetricRecord, TestId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;
    use tokio::time::Instant;

    /// Fails the first `failures` sends and records when each attempt happened
    struct FlakySink {
        failures: u32,
        retries: bool,
        calls: AtomicU32,
        attempts: Mutex<Vec<Instant>>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                retries: true,
                calls: AtomicU32::new(0),
                attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SinkClient for FlakySink {
        fn describe(&self) -> String {
            "flaky".to_string()
        }

        fn retries(&self) -> bool {
            self.retries
        }

        async fn send(&self, _record: &Record) -> DeliveryResult<()> {
            self.attempts.lock().await.push(Instant::now());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(DeliveryError::Transient("503".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn metric() -> Record {
        Record::Metric(MetricRecord {
            test_id: TestId::new(),
            timestamp: Utc::now(),
            name: "latency".to_string(),
            value: 1.0,
            unit: "ms".to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_sink_gets_three_attempts_with_doubling_backoff() {
        let sink = FlakySink::new(u32::MAX);
        let stats = DeliveryStats::new();
        let started = Instant::now();

        let result = deliver_with_retry(&sink, &metric(), &RetryConfig::default(), &stats).await;

        assert!(matches!(result, Err(DeliveryError::Transient(_))));
        assert_eq!(sink.calls.load(Ordering::SeqCst), 3);

        let attempts = sink.attempts.lock().await;
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(1));
        assert_eq!(attempts[2] - attempts[1], Duration::from_secs(2));
        // the last backoff elapses before the failure is reported
        assert_eq!(started.elapsed(), Duration::from_secs(7));
        assert_eq!(stats.snapshot().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_one_failure() {
        let sink = FlakySink::new(1);
        let stats = DeliveryStats::new();

        let attempts = deliver_with_retry(&sink, &metric(), &RetryConfig::default(), &stats)
            .await
            .unwrap();

        assert_eq!(attempts, 2);
        assert_eq!(stats.snapshot().retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retrying_sink_fails_immediately() {
        let mut sink = FlakySink::new(u32::MAX);
        sink.retries = false;
        let started = Instant::now();

        let result = deliver_with_retry(
            &sink,
            &metric(),
            &RetryConfig::default(),
            &DeliveryStats::new(),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(sink.calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
