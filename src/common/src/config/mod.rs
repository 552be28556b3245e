use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Configuration for the test store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `memory://` for the in-process store, or a `sqlite:` DSN
    pub dsn: String,
    /// Upper bound for a single store call
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("memory://"),
            timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Create an in-memory store configuration, mostly useful for tests
    pub fn in_memory() -> Self {
        Self::default()
    }
}

/// Retry policy for destinations that support redelivery
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    /// Factor applied to the delay after every failed attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given failed attempt (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        self.initial_backoff
            .mul_f64(self.backoff_multiplier.powi(exponent))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent delivery workers
    pub workers: usize,
    /// Queue slots per worker; the queue holds `workers * queue_capacity_per_worker` records
    pub queue_capacity_per_worker: usize,
    /// Per-attempt timeout for HTTP destinations
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Rotation interval for file destinations, in minutes
    pub file_rotation_minutes: u64,
    pub retry: RetryConfig,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity_per_worker: 256,
            request_timeout: Duration::from_secs(5),
            file_rotation_minutes: 60,
            retry: RetryConfig::default(),
        }
    }
}

impl DeliveryConfig {
    pub fn queue_capacity(&self) -> usize {
        self.workers * self.queue_capacity_per_worker
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.file_rotation_minutes * 60)
    }
}

/// Shape of the synthetic records
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Center value for generated metric samples
    pub metric_base: f64,
    /// Maximum absolute deviation from `metric_base`
    pub metric_jitter: f64,
    #[serde(with = "humantime_serde")]
    pub trace_min_duration: Duration,
    #[serde(with = "humantime_serde")]
    pub trace_max_duration: Duration,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            metric_base: 100.0,
            metric_jitter: 5.0,
            trace_min_duration: Duration::from_millis(5),
            trace_max_duration: Duration::from_millis(500),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// How long cancellation and shutdown wait for a task to exit
    #[serde(with = "humantime_serde")]
    pub cancel_timeout: Duration,
    /// Reconcile persisted tests with the (empty) task registry on startup
    pub recover_on_startup: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cancel_timeout: Duration::from_secs(10),
            recover_on_startup: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    pub listen: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: String::from("0.0.0.0:8080"),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Test store configuration
    pub store: StoreConfig,
    /// Delivery worker pool and sink configuration
    pub delivery: DeliveryConfig,
    /// Record generation parameters
    pub generator: GeneratorConfig,
    /// Lifecycle timeouts
    pub orchestrator: OrchestratorConfig,
    /// HTTP API listener
    pub api: ApiConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("loadgen.toml"))
            .merge(Env::prefixed("LOADGEN__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("LOADGEN__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Reject settings the runtime cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.store.dsn.is_empty() {
            anyhow::bail!("Store DSN cannot be empty");
        }
        if self.delivery.workers == 0 {
            anyhow::bail!("delivery.workers must be at least 1");
        }
        if self.delivery.queue_capacity_per_worker == 0 {
            anyhow::bail!("delivery.queue_capacity_per_worker must be at least 1");
        }
        if self.delivery.file_rotation_minutes == 0 {
            anyhow::bail!("delivery.file_rotation_minutes must be at least 1");
        }
        if self.delivery.retry.max_attempts == 0 {
            anyhow::bail!("delivery.retry.max_attempts must be at least 1");
        }
        if self.delivery.retry.backoff_multiplier < 1.0 {
            anyhow::bail!("delivery.retry.backoff_multiplier must be >= 1.0");
        }
        if self.generator.trace_min_duration > self.generator.trace_max_duration {
            anyhow::bail!("generator.trace_min_duration exceeds generator.trace_max_duration");
        }
        Ok(())
    }
}
