//! Persistence contract for tests.
//!
//! The orchestrator only relies on the four operations of [`TestStore`]. Every call
//! may fail or be slow; callers bound them with the configured store timeout.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::model::{Test, TestFilter, TestId, TestUpdate};

pub mod memory;
pub mod sql;

pub use memory::InMemoryTestStore;
pub use sql::SqlTestStore;

/// Error types that can occur during store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("test {0} not found")]
    NotFound(TestId),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("failed to (de)serialize test: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait TestStore: Send + Sync {
    /// Persist a new test. Assigns an id when the test has none and returns it.
    async fn insert(&self, test: &Test) -> StoreResult<TestId>;

    /// Look up a test, `Ok(None)` when it does not exist
    async fn find_by_id(&self, id: &TestId) -> StoreResult<Option<Test>>;

    /// Apply a partial update. Fails with `NotFound` for unknown ids.
    async fn update_fields(&self, id: &TestId, update: &TestUpdate) -> StoreResult<()>;

    /// All tests matching the filter, oldest first
    async fn find_all(&self, filter: &TestFilter) -> StoreResult<Vec<Test>>;
}

/// Open the store selected by the configured DSN
pub async fn connect(config: &StoreConfig) -> StoreResult<Arc<dyn TestStore>> {
    if config.dsn.starts_with("memory:") {
        log::info!("Using in-memory test store");
        Ok(Arc::new(InMemoryTestStore::new()))
    } else if config.dsn.starts_with("sqlite:") {
        Ok(Arc::new(SqlTestStore::new(&config.dsn).await?))
    } else {
        Err(StoreError::Backend(format!(
            "unsupported store DSN '{}', expected memory:// or sqlite:",
            config.dsn
        )))
    }
}
