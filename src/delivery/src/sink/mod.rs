use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::config::DeliveryConfig;
use common::{Destination, DestinationTarget, Record};

use crate::{DeliveryError, DeliveryResult};

pub mod file;
pub mod http;

pub use file::FileSink;
pub use http::HttpSink;

/// One destination records are delivered to
#[async_trait]
pub trait SinkClient: Send + Sync {
    /// Human readable target, used in logs
    fn describe(&self) -> String;

    /// Whether failed sends should be retried with backoff
    fn retries(&self) -> bool {
        false
    }

    /// Deliver a single record
    async fn send(&self, record: &Record) -> DeliveryResult<()>;

    /// Release the sink's resources. Must be idempotent.
    async fn close(&self) -> DeliveryResult<()> {
        Ok(())
    }
}

/// Opens sinks for configured destinations
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn open(&self, destination: &Destination) -> DeliveryResult<Arc<dyn SinkClient>>;
}

/// Opens rotating file sinks and HTTP sinks sharing one connection pool
pub struct DefaultSinkFactory {
    http: reqwest::Client,
    request_timeout: Duration,
    rotation_interval: Duration,
}

impl DefaultSinkFactory {
    pub fn new(config: &DeliveryConfig) -> DeliveryResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| DeliveryError::InvalidDestination(e.to_string()))?;

        Ok(Self {
            http,
            request_timeout: config.request_timeout,
            rotation_interval: config.rotation_interval(),
        })
    }
}

#[async_trait]
impl SinkFactory for DefaultSinkFactory {
    async fn open(&self, destination: &Destination) -> DeliveryResult<Arc<dyn SinkClient>> {
        match &destination.target {
            DestinationTarget::File { path } => {
                let sink = FileSink::open(path.clone(), self.rotation_interval).await?;
                Ok(Arc::new(sink))
            }
            DestinationTarget::Http { .. } => {
                let sink = HttpSink::new(self.http.clone(), destination, self.request_timeout)?;
                Ok(Arc::new(sink))
            }
        }
    }
}
