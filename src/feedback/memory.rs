//! In-memory feedback store (non-persistent).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{sort_records, FeedbackQuery, FeedbackRecord, FeedbackStore, StoreError};

#[derive(Clone, Default)]
pub struct InMemoryFeedbackStore {
    records: Arc<RwLock<Vec<FeedbackRecord>>>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl FeedbackStore for InMemoryFeedbackStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn append(&self, record: FeedbackRecord) -> Result<(), StoreError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn query(&self, query: &FeedbackQuery) -> Result<Vec<FeedbackRecord>, StoreError> {
        let mut matched: Vec<FeedbackRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        sort_records(&mut matched);
        Ok(matched)
    }
}
