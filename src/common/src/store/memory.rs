use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StoreError, StoreResult, TestStore};
use crate::model::{Test, TestFilter, TestId, TestUpdate};

/// Process-local store, used by default and in tests
#[derive(Debug, Default)]
pub struct InMemoryTestStore {
    tests: RwLock<HashMap<TestId, Test>>,
}

impl InMemoryTestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TestStore for InMemoryTestStore {
    async fn insert(&self, test: &Test) -> StoreResult<TestId> {
        let id = test.id.clone().unwrap_or_default();
        let mut stored = test.clone();
        stored.id = Some(id.clone());

        let mut tests = self.tests.write().await;
        if tests.contains_key(&id) {
            return Err(StoreError::Backend(format!("test {id} already exists")));
        }
        tests.insert(id.clone(), stored);
        Ok(id)
    }

    async fn find_by_id(&self, id: &TestId) -> StoreResult<Option<Test>> {
        Ok(self.tests.read().await.get(id).cloned())
    }

    async fn update_fields(&self, id: &TestId, update: &TestUpdate) -> StoreResult<()> {
        let mut tests = self.tests.write().await;
        let test = tests
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        test.apply(update);
        Ok(())
    }

    async fn find_all(&self, filter: &TestFilter) -> StoreResult<Vec<Test>> {
        let tests = self.tests.read().await;
        let mut matching: Vec<Test> = tests
            .values()
            .filter(|test| filter.matches(test))
            .cloned()
            .collect();
        matching.sort_by_key(|test| test.created_at);
        Ok(matching)
    }
}
