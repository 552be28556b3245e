//! Record delivery for running tests.
//!
//! Generated records are submitted to a bounded, lossy queue drained by a fixed
//! set of workers. Each worker fans a record out to every destination registered
//! for the record's test, retrying destinations that support it.

pub mod pool;
pub mod retry;
pub mod sink;
pub mod stats;

pub use pool::DeliveryWorkerPool;
pub use retry::deliver_with_retry;
pub use sink::{DefaultSinkFactory, FileSink, HttpSink, SinkClient, SinkFactory};
pub use stats::{DeliveryStats, DeliveryStatsSnapshot};

/// Errors raised while queueing or delivering records
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("delivery queue is full")]
    QueueFull,

    #[error("delivery pool is closed")]
    Closed,

    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink is closed")]
    SinkClosed,

    #[error("invalid destination: {0}")]
    InvalidDestination(String),
}

pub type DeliveryResult<T> = Result<T, DeliveryError>;
