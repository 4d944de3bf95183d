mod dynamo;
mod memory;

pub use dynamo::{DynamoDeletionQueue, DynamoRetentionLedger};
pub use memory::{InMemoryDeletionQueue, InMemoryRetentionLedger};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use shared::tenant::TenantId;

use crate::logic::scheduler::RetentionEntry;

/// The retention ledger. Rows are only ever written and updated; completed
/// deletions are marked, never removed, because the ledger itself is audit
/// material with its own retention obligations.
#[async_trait::async_trait]
pub trait RetentionLedgerLike: Send + Sync {
    async fn put_entry(&self, entry: &RetentionEntry) -> Result<(), CommonError>;

    async fn get_entry(&self, retention_id: &str) -> Result<Option<RetentionEntry>, CommonError>;

    async fn list_entries_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<RetentionEntry>, CommonError>;

    /// Active entries whose expiry has passed. Entries already handed to the
    /// approval queue do not reappear here.
    async fn list_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetentionEntry>, CommonError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionQueueStatus {
    PendingApproval,
    RetryNeeded,
    Done,
}

impl DeletionQueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionQueueStatus::PendingApproval => "pending-approval",
            DeletionQueueStatus::RetryNeeded => "retry-needed",
            DeletionQueueStatus::Done => "done",
        }
    }
}

/// Work item for deletions that could not complete inline: either waiting on
/// a human approval, or parked for retry after transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletionQueueItem {
    pub queue_id: String,
    pub retention_id: String,
    pub tenant_id: TenantId,
    pub reason: String,
    pub requested_by: String,
    pub status: DeletionQueueStatus,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
}

impl DeletionQueueItem {
    pub fn pending_approval(
        entry: &RetentionEntry,
        reason: impl Into<String>,
        requested_by: impl Into<String>,
    ) -> Self {
        Self {
            queue_id: format!("approval-{}", uuid::Uuid::new_v4()),
            retention_id: entry.retention_id.clone(),
            tenant_id: entry.tenant_id.clone(),
            reason: reason.into(),
            requested_by: requested_by.into(),
            status: DeletionQueueStatus::PendingApproval,
            retry_count: 0,
            queued_at: Utc::now(),
        }
    }

    pub fn retry_needed(
        entry: &RetentionEntry,
        reason: impl Into<String>,
        requested_by: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            queue_id: format!("retry-{}", uuid::Uuid::new_v4()),
            retention_id: entry.retention_id.clone(),
            tenant_id: entry.tenant_id.clone(),
            reason: reason.into(),
            requested_by: requested_by.into(),
            status: DeletionQueueStatus::RetryNeeded,
            retry_count,
            queued_at: Utc::now(),
        }
    }
}

#[async_trait::async_trait]
pub trait DeletionQueueLike: Send + Sync {
    async fn enqueue(&self, item: &DeletionQueueItem) -> Result<(), CommonError>;

    async fn get(&self, queue_id: &str) -> Result<Option<DeletionQueueItem>, CommonError>;

    async fn list_by_status(
        &self,
        status: DeletionQueueStatus,
    ) -> Result<Vec<DeletionQueueItem>, CommonError>;

    /// Queue items are consumed on completion, unlike ledger rows.
    async fn remove(&self, queue_id: &str) -> Result<(), CommonError>;
}
