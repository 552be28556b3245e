use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::TestId;

/// One of the three record categories a test emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Logs,
    Metrics,
    Traces,
}

impl SignalType {
    pub const ALL: [SignalType; 3] = [SignalType::Logs, SignalType::Metrics, SignalType::Traces];

    /// Path segment used by HTTP destinations
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Logs => "logs",
            SignalType::Metrics => "metrics",
            SignalType::Traces => "traces",
        }
    }
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warn,
        LogLevel::Error,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub test_id: TestId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub test_id: TestId,
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub test_id: TestId,
    pub timestamp: DateTime<Utc>,
    /// 16 bytes, hex encoded
    pub trace_id: String,
    /// 8 bytes, hex encoded
    pub span_id: String,
    pub operation: String,
    pub duration_ms: u64,
}

/// A generated record travelling through the delivery queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Record {
    Log(LogRecord),
    Metric(MetricRecord),
    Trace(TraceRecord),
}

impl Record {
    pub fn test_id(&self) -> &TestId {
        match self {
            Record::Log(r) => &r.test_id,
            Record::Metric(r) => &r.test_id,
            Record::Trace(r) => &r.test_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Record::Log(r) => r.timestamp,
            Record::Metric(r) => r.timestamp,
            Record::Trace(r) => r.timestamp,
        }
    }

    pub fn signal_type(&self) -> SignalType {
        match self {
            Record::Log(_) => SignalType::Logs,
            Record::Metric(_) => SignalType::Metrics,
            Record::Trace(_) => SignalType::Traces,
        }
    }

    /// Serialize to a single JSON document without trailing newline
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
