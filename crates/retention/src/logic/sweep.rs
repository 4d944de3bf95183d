// Periodic retention sweep. Batch job, not request-driven: scans the ledger
// for expired entries and either hands them to the executor or parks them for
// approval. Every item is self-contained, so the sweep can be interrupted
// between items and simply re-scanned later.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::audit::{AuditEvent, AuditResult, AuditSinkLike};
use shared::error::CommonError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::logic::executor::DeletionExecutor;
use crate::logic::scheduler::{RetentionEntryStatus, SYSTEM_ACTOR};
use crate::repository::{DeletionQueueItem, DeletionQueueLike, RetentionLedgerLike};

pub const EXPIRY_REASON: &str = "retention-policy-expiry";

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepSummary {
    pub reviewed: usize,
    pub deleted: usize,
    pub queued_for_approval: usize,
    pub errors: usize,
    pub interrupted: bool,
}

pub struct RetentionSweep {
    ledger: Arc<dyn RetentionLedgerLike>,
    queue: Arc<dyn DeletionQueueLike>,
    executor: Arc<DeletionExecutor>,
    audit: Arc<dyn AuditSinkLike>,
}

impl RetentionSweep {
    pub fn new(
        ledger: Arc<dyn RetentionLedgerLike>,
        queue: Arc<dyn DeletionQueueLike>,
        executor: Arc<DeletionExecutor>,
        audit: Arc<dyn AuditSinkLike>,
    ) -> Self {
        Self {
            ledger,
            queue,
            executor,
            audit,
        }
    }

    /// Process everything expired as of `now`.
    ///
    /// Approval-required entries move to the approval queue and wait there;
    /// nothing is physically removed for them until someone approves. The
    /// token is checked between items, so cancellation leaves the ledger
    /// consistent and the next run picks up where this one stopped.
    pub async fn run(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, CommonError> {
        let expired = self.ledger.list_expired(now).await?;
        let mut summary = SweepSummary::default();

        for entry in expired {
            if cancel.is_cancelled() {
                info!("sweep interrupted, remaining items will be picked up by the next scan");
                summary.interrupted = true;
                break;
            }
            summary.reviewed += 1;

            if entry.requires_approval {
                let item = DeletionQueueItem::pending_approval(&entry, EXPIRY_REASON, SYSTEM_ACTOR);
                self.queue.enqueue(&item).await?;
                let mut updated = entry.clone();
                updated.status = RetentionEntryStatus::PendingApproval;
                self.ledger.put_entry(&updated).await?;
                summary.queued_for_approval += 1;
            } else {
                match self
                    .executor
                    .delete(&entry, entry.method, EXPIRY_REASON, SYSTEM_ACTOR, false)
                    .await
                {
                    Ok(()) => summary.deleted += 1,
                    Err(err) => {
                        // the executor already parked the item and alerted
                        warn!(
                            retention_id = %entry.retention_id,
                            error = %err,
                            "sweep deletion failed"
                        );
                        summary.errors += 1;
                    }
                }
            }
        }

        self.audit
            .emit(
                AuditEvent::new(
                    SYSTEM_ACTOR,
                    "retention_sweep",
                    "retention-ledger",
                    if summary.errors == 0 {
                        AuditResult::Success
                    } else {
                        AuditResult::Partial
                    },
                )
                .detail(serde_json::to_value(&summary)?),
            )
            .await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::logic::policy::{DataCategory, DeletionMethod};
    use crate::logic::scheduler::RetentionScheduler;
    use crate::logic::test_support::Harness;
    use crate::repository::DeletionQueueStatus;
    use chrono::Duration;
    use shared::identity::{Actor, Role};
    use shared::storage::{DELETED_MARKER, DocumentStoreLike};
    use shared::tenant::{TenantId, TenantScope};

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    async fn store_document(harness: &Harness, resource_type: &str, resource_id: &str) {
        let scope = TenantScope::new(tenant(), resource_type).unwrap();
        harness
            .documents
            .put_item(&scope, resource_id, &serde_json::json!({"payload": "x"}))
            .await
            .unwrap();
    }

    async fn schedule_expired(
        scheduler: &RetentionScheduler,
        category: DataCategory,
        resource_type: &str,
        resource_id: &str,
        days_past_expiry: i64,
    ) -> String {
        let retention_days = crate::logic::policy::policy_for(category)
            .retention_days
            .unwrap();
        scheduler
            .schedule(
                &tenant(),
                category,
                resource_type,
                resource_id,
                Utc::now() - Duration::days(retention_days + days_past_expiry),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_hard_deletes_automatic_categories() {
        let harness = Harness::new();
        store_document(&harness, "logs", "log-1").await;
        schedule_expired(&harness.scheduler, DataCategory::SystemLogs, "logs", "log-1", 5).await;

        let summary = harness
            .sweep()
            .run(Utc::now(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.reviewed, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.queued_for_approval, 0);

        let scope = TenantScope::new(tenant(), "logs").unwrap();
        assert!(
            harness
                .documents
                .get_item(&scope, "log-1")
                .await
                .unwrap()
                .is_none()
        );
        let entry = harness
            .ledger
            .get_entry("acme#logs#log-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, RetentionEntryStatus::Deleted);
        assert_eq!(entry.deletion_method, Some(DeletionMethod::HardDelete));
    }

    #[tokio::test]
    async fn test_expired_billing_data_waits_for_approval() {
        let harness = Harness::new();
        store_document(&harness, "invoices", "inv-1").await;
        let retention_id = schedule_expired(
            &harness.scheduler,
            DataCategory::BillingData,
            "invoices",
            "inv-1",
            1,
        )
        .await;

        let summary = harness
            .sweep()
            .run(Utc::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.queued_for_approval, 1);
        assert_eq!(summary.deleted, 0);

        // nothing physically removed, entry parked pending approval
        let scope = TenantScope::new(tenant(), "invoices").unwrap();
        let stored = harness
            .documents
            .get_item(&scope, "inv-1")
            .await
            .unwrap()
            .unwrap();
        assert!(stored.get(DELETED_MARKER).is_none());
        let entry = harness
            .ledger
            .get_entry(&retention_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, RetentionEntryStatus::PendingApproval);

        // approval soft-deletes in place, bytes retained
        let pending = harness
            .queue
            .list_by_status(DeletionQueueStatus::PendingApproval)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        let approver = Actor::new("admin-1", Role::CustomerAdmin);
        harness
            .executor
            .approve(&approver, &pending[0].queue_id)
            .await
            .unwrap();

        let stored = harness
            .documents
            .get_item(&scope, "inv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored[DELETED_MARKER], true);
        let entry = harness
            .ledger
            .get_entry(&retention_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, RetentionEntryStatus::Deleted);
        assert_eq!(entry.deletion_method, Some(DeletionMethod::SoftDelete));
        assert!(
            harness
                .queue
                .get(&pending[0].queue_id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_queued_entries_do_not_reappear_in_next_sweep() {
        let harness = Harness::new();
        store_document(&harness, "invoices", "inv-1").await;
        schedule_expired(
            &harness.scheduler,
            DataCategory::BillingData,
            "invoices",
            "inv-1",
            1,
        )
        .await;

        let sweep = harness.sweep();
        let first = sweep.run(Utc::now(), &CancellationToken::new()).await.unwrap();
        assert_eq!(first.queued_for_approval, 1);

        let second = sweep.run(Utc::now(), &CancellationToken::new()).await.unwrap();
        assert_eq!(second.reviewed, 0);
        assert_eq!(
            harness
                .queue
                .list_by_status(DeletionQueueStatus::PendingApproval)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancelled_sweep_leaves_ledger_consistent() {
        let harness = Harness::new();
        store_document(&harness, "logs", "log-1").await;
        store_document(&harness, "logs", "log-2").await;
        schedule_expired(&harness.scheduler, DataCategory::SystemLogs, "logs", "log-1", 5).await;
        schedule_expired(&harness.scheduler, DataCategory::SystemLogs, "logs", "log-2", 5).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = harness.sweep().run(Utc::now(), &cancel).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.reviewed, 0);

        // nothing half-done: both entries still active, resumption re-scans
        let resumed = harness
            .sweep()
            .run(Utc::now(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.reviewed, 2);
        assert_eq!(resumed.deleted, 2);
    }
}
