mod record;
mod status;

pub use load_test::{
    Destination, DestinationTarget, NewTest, RestartOverrides, SignalCounts, Test, TestFilter,
    TestId, TestUpdate,
};
pub use record::{LogLevel, LogRecord, MetricRecord, Record, SignalType, TraceRecord};
pub use status::{TestStatus, UnknownStatus};
