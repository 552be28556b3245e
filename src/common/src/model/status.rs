use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Cancelled,
    Error,
    ResultsSaved,
}

impl TestStatus {
    pub const ALL: [TestStatus; 7] = [
        TestStatus::Pending,
        TestStatus::Scheduled,
        TestStatus::Running,
        TestStatus::Completed,
        TestStatus::Cancelled,
        TestStatus::Error,
        TestStatus::ResultsSaved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pending => "pending",
            TestStatus::Scheduled => "scheduled",
            TestStatus::Running => "running",
            TestStatus::Completed => "completed",
            TestStatus::Cancelled => "cancelled",
            TestStatus::Error => "error",
            TestStatus::ResultsSaved => "results_saved",
        }
    }

    /// The transition table. Anything not listed here is rejected.
    pub fn can_transition_to(&self, next: TestStatus) -> bool {
        use TestStatus::*;

        matches!(
            (*self, next),
            (Pending, Scheduled | Running | Cancelled)
                | (Scheduled, Scheduled | Running | Cancelled)
                | (Running, Completed | Cancelled | Error)
                | (Completed, Running | ResultsSaved)
                | (Error, Running | ResultsSaved)
                | (Cancelled, Running)
        )
    }

    /// A run has ended and may be restarted
    pub fn is_restartable(&self) -> bool {
        matches!(
            self,
            TestStatus::Completed | TestStatus::Cancelled | TestStatus::Error
        )
    }

    /// Statuses a test is created in by the API layer
    pub fn is_startable(&self) -> bool {
        matches!(self, TestStatus::Pending | TestStatus::Scheduled)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown test status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for TestStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TestStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}
