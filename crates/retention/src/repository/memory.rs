use chrono::{DateTime, Utc};
use dashmap::DashMap;
use shared::error::CommonError;
use shared::tenant::TenantId;

use crate::logic::scheduler::RetentionEntry;
use crate::repository::{
    DeletionQueueItem, DeletionQueueLike, DeletionQueueStatus, RetentionLedgerLike,
};

/// In-memory retention ledger for tests.
#[derive(Default)]
pub struct InMemoryRetentionLedger {
    entries: DashMap<String, RetentionEntry>,
}

impl InMemoryRetentionLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RetentionLedgerLike for InMemoryRetentionLedger {
    async fn put_entry(&self, entry: &RetentionEntry) -> Result<(), CommonError> {
        self.entries
            .insert(entry.retention_id.clone(), entry.clone());
        Ok(())
    }

    async fn get_entry(&self, retention_id: &str) -> Result<Option<RetentionEntry>, CommonError> {
        Ok(self.entries.get(retention_id).map(|e| e.clone()))
    }

    async fn list_entries_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<RetentionEntry>, CommonError> {
        let mut entries: Vec<RetentionEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.tenant_id == *tenant_id)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.retention_id.cmp(&b.retention_id));
        Ok(entries)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetentionEntry>, CommonError> {
        let mut entries: Vec<RetentionEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.retention_id.cmp(&b.retention_id));
        Ok(entries)
    }
}

/// In-memory deletion queue for tests.
#[derive(Default)]
pub struct InMemoryDeletionQueue {
    items: DashMap<String, DeletionQueueItem>,
}

impl InMemoryDeletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait::async_trait]
impl DeletionQueueLike for InMemoryDeletionQueue {
    async fn enqueue(&self, item: &DeletionQueueItem) -> Result<(), CommonError> {
        self.items.insert(item.queue_id.clone(), item.clone());
        Ok(())
    }

    async fn get(&self, queue_id: &str) -> Result<Option<DeletionQueueItem>, CommonError> {
        Ok(self.items.get(queue_id).map(|i| i.clone()))
    }

    async fn list_by_status(
        &self,
        status: DeletionQueueStatus,
    ) -> Result<Vec<DeletionQueueItem>, CommonError> {
        let mut items: Vec<DeletionQueueItem> = self
            .items
            .iter()
            .filter(|item| item.status == status)
            .map(|item| item.value().clone())
            .collect();
        items.sort_by(|a, b| a.queue_id.cmp(&b.queue_id));
        Ok(items)
    }

    async fn remove(&self, queue_id: &str) -> Result<(), CommonError> {
        self.items.remove(queue_id);
        Ok(())
    }
}
