use async_trait::async_trait;
use tokio::sync::RwLock;

use super::HistoryStore;
use crate::error::Result;
use crate::types::HistoryRecord;

/// In-process history log. Used when no database is configured, and by tests.
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    rows: RwLock<Vec<HistoryRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<()> {
        self.rows.write().await.push(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        Ok(self.rows.read().await.iter().rev().take(limit).cloned().collect())
    }

    async fn all(&self) -> Result<Vec<HistoryRecord>> {
        Ok(self.rows.read().await.clone())
    }
}
