pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod store;

pub use error::{CoreError, CoreResult, FieldError};
pub use model::{
    Destination, DestinationTarget, LogLevel, LogRecord, MetricRecord, NewTest, Record,
    RestartOverrides, SignalCounts, SignalType, Test, TestFilter, TestId, TestStatus, TestUpdate,
    TraceRecord,
};
pub use store::{StoreError, StoreResult, TestStore};
