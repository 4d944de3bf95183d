// Deletion executor: applies the policy-mandated destruction method to an
// expired retention entry. Destruction is one-way; the only undo is the
// key-destruction grace window, never application logic.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use encryption::logic::registry::{CustomerKeyRegistry, MIN_DESTRUCTION_WINDOW_DAYS};
use shared::audit::{AuditEvent, AuditResult, AuditSinkLike};
use shared::authz::AccessGate;
use shared::error::CommonError;
use shared::identity::{Actor, Permission};
use shared::storage::{DocumentStoreLike, ObjectStoreLike};
use shared::tenant::TenantScope;
use tracing::{error, info, warn};

use crate::logic::policy::DeletionMethod;
use crate::logic::scheduler::{RetentionEntry, RetentionEntryStatus};
use crate::repository::{
    DeletionQueueItem, DeletionQueueLike, DeletionQueueStatus, RetentionLedgerLike,
};

pub const DEFAULT_MAX_DELETE_ATTEMPTS: u32 = 3;

/// Outcome of a whole-tenant purge.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TenantPurgeSummary {
    pub tenant_id: shared::tenant::TenantId,
    /// Deleted ledger entries per data category.
    pub items_deleted: std::collections::BTreeMap<String, usize>,
    pub key_destroyed: bool,
    pub objects_removed: usize,
    pub errors: Vec<String>,
}

pub struct DeletionExecutor {
    ledger: Arc<dyn RetentionLedgerLike>,
    queue: Arc<dyn DeletionQueueLike>,
    documents: Arc<dyn DocumentStoreLike>,
    objects: Arc<dyn ObjectStoreLike>,
    registry: Arc<CustomerKeyRegistry>,
    gate: Arc<AccessGate>,
    audit: Arc<dyn AuditSinkLike>,
    max_attempts: u32,
    backoff_base: Duration,
}

impl DeletionExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<dyn RetentionLedgerLike>,
        queue: Arc<dyn DeletionQueueLike>,
        documents: Arc<dyn DocumentStoreLike>,
        objects: Arc<dyn ObjectStoreLike>,
        registry: Arc<CustomerKeyRegistry>,
        gate: Arc<AccessGate>,
        audit: Arc<dyn AuditSinkLike>,
    ) -> Self {
        Self {
            ledger,
            queue,
            documents,
            objects,
            registry,
            gate,
            audit,
            max_attempts: DEFAULT_MAX_DELETE_ATTEMPTS,
            backoff_base: Duration::from_millis(200),
        }
    }

    pub fn with_backoff(mut self, max_attempts: u32, backoff_base: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.backoff_base = backoff_base;
        self
    }

    /// Apply `method` to the entry's resource and mark the ledger row
    /// deleted. Transient failures are retried with backoff up to the
    /// configured cap, then parked on the retry queue and raised as an
    /// operator alert.
    ///
    /// `tenant_purge` marks a whole-tenant offboarding run, which is the only
    /// context where crypto-erasure may skip the live-data guard.
    pub async fn delete(
        &self,
        entry: &RetentionEntry,
        method: DeletionMethod,
        reason: &str,
        requested_by: &str,
        tenant_purge: bool,
    ) -> Result<(), CommonError> {
        let mut attempt = 0u32;
        let result = loop {
            attempt += 1;
            match self.execute_method(entry, method, tenant_purge).await {
                Ok(()) => break Ok(()),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.backoff_base * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        retention_id = %entry.retention_id,
                        attempt,
                        error = %err,
                        "deletion attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => break Err(err),
            }
        };

        match result {
            Ok(()) => {
                self.mark_deleted(entry, method, reason).await?;
                self.audit
                    .emit(
                        AuditEvent::new(
                            requested_by,
                            "delete_resource",
                            &entry.resource_type,
                            AuditResult::Success,
                        )
                        .tenant(entry.tenant_id.as_str())
                        .resource(&entry.resource_id)
                        .detail(serde_json::json!({
                            "retention_id": entry.retention_id,
                            "deletion_method": method.as_str(),
                            "reason": reason,
                        })),
                    )
                    .await?;
                info!(
                    retention_id = %entry.retention_id,
                    method = method.as_str(),
                    "deleted resource"
                );
                Ok(())
            }
            Err(err) if err.is_retryable() => {
                // retries exhausted: park for later and alert an operator
                let item = DeletionQueueItem::retry_needed(entry, reason, requested_by, attempt);
                self.queue.enqueue(&item).await?;
                error!(
                    retention_id = %entry.retention_id,
                    attempts = attempt,
                    error = %err,
                    "deletion retries exhausted, queued for retry"
                );
                self.audit
                    .emit(
                        AuditEvent::new(
                            requested_by,
                            "deletion_retry_exhausted",
                            &entry.resource_type,
                            AuditResult::Error,
                        )
                        .tenant(entry.tenant_id.as_str())
                        .resource(&entry.resource_id)
                        .error_message(err.to_string())
                        .detail(serde_json::json!({
                            "retention_id": entry.retention_id,
                            "queue_id": item.queue_id,
                            "attempts": attempt,
                        })),
                    )
                    .await?;
                Err(CommonError::DeletionFailed {
                    msg: format!(
                        "deletion of '{}' failed after {attempt} attempts",
                        entry.retention_id
                    ),
                    source: Some(anyhow::anyhow!("{err}")),
                })
            }
            Err(err) => {
                self.audit
                    .emit(
                        AuditEvent::new(
                            requested_by,
                            "delete_resource",
                            &entry.resource_type,
                            AuditResult::Error,
                        )
                        .tenant(entry.tenant_id.as_str())
                        .resource(&entry.resource_id)
                        .error_message(err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// Execute a queued deletion that was waiting on human approval.
    pub async fn approve(&self, approver: &Actor, queue_id: &str) -> Result<(), CommonError> {
        let item = self
            .queue
            .get(queue_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: "deletion queue item not found".to_string(),
                lookup_id: queue_id.to_string(),
                source: None,
            })?;
        if item.status != DeletionQueueStatus::PendingApproval {
            return Err(CommonError::InvalidRequest {
                msg: format!(
                    "queue item '{queue_id}' is {} and cannot be approved",
                    item.status.as_str()
                ),
                source: None,
            });
        }

        self.gate
            .require(
                approver,
                Permission::ApproveDeletion,
                "approve_deletion",
                &item.tenant_id,
                "deletion-queue",
                Some(queue_id),
            )
            .await?;

        let entry = self
            .ledger
            .get_entry(&item.retention_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: "retention entry for queue item not found".to_string(),
                lookup_id: item.retention_id.clone(),
                source: None,
            })?;

        self.delete(
            &entry,
            entry.method,
            &format!("approved: {}", item.reason),
            &approver.id,
            false,
        )
        .await?;
        self.queue.remove(queue_id).await
    }

    /// Whole-tenant offboarding: delete every non-audit-log resource the
    /// ledger tracks for the tenant by its category's method, then destroy
    /// the tenant key. Audit-log entries are exempt; they remain under their
    /// own retention obligations.
    ///
    /// Per-item failures are collected rather than aborting the purge, so a
    /// single bad resource cannot leave the rest of the tenant's data alive.
    pub async fn purge_tenant(
        &self,
        tenant_id: &shared::tenant::TenantId,
        reason: &str,
        requested_by: &str,
    ) -> Result<TenantPurgeSummary, CommonError> {
        let entries = self.ledger.list_entries_for_tenant(tenant_id).await?;
        let mut summary = TenantPurgeSummary {
            tenant_id: tenant_id.clone(),
            items_deleted: std::collections::BTreeMap::new(),
            key_destroyed: false,
            objects_removed: 0,
            errors: Vec::new(),
        };

        for entry in &entries {
            if entry.status == RetentionEntryStatus::Deleted {
                continue;
            }
            if entry.category == crate::logic::policy::DataCategory::AuditLogs {
                continue;
            }
            // byte-level method per entry; crypto-erasure entries get their
            // bytes removed here and their meaning destroyed with the key
            let byte_method = match entry.method {
                DeletionMethod::SoftDelete => DeletionMethod::SoftDelete,
                _ => DeletionMethod::HardDelete,
            };
            let scope = TenantScope::new(entry.tenant_id.clone(), &entry.resource_type)?;
            let removal = match byte_method {
                DeletionMethod::SoftDelete => {
                    self.documents
                        .mark_deleted(&scope, &entry.resource_id, Utc::now())
                        .await
                }
                _ => {
                    self.documents
                        .delete_item(&scope, &entry.resource_id)
                        .await
                }
            };
            match removal {
                Ok(()) => {
                    self.mark_deleted(entry, entry.method, reason).await?;
                    *summary
                        .items_deleted
                        .entry(entry.category.as_str().to_string())
                        .or_insert(0) += 1;
                }
                Err(err) => {
                    summary
                        .errors
                        .push(format!("{}: {err}", entry.retention_id));
                }
            }
        }

        // remove every remaining tenant blob (payloads, export bundles)
        match self
            .objects
            .delete_prefix(&shared::tenant::tenant_object_prefix(tenant_id))
            .await
        {
            Ok(removed) => summary.objects_removed = removed,
            Err(err) => summary.errors.push(format!("object prefix: {err}")),
        }

        // cryptographic erasure: whatever ciphertext survives the byte sweep
        // dies with the key
        match self
            .registry
            .destroy_key(tenant_id, MIN_DESTRUCTION_WINDOW_DAYS)
            .await
        {
            Ok(destroyed) => summary.key_destroyed = destroyed,
            Err(CommonError::NotFound { .. }) => {
                // tenant never had encrypted data
            }
            Err(err) => summary.errors.push(format!("key destruction: {err}")),
        }

        self.audit
            .emit(
                AuditEvent::new(
                    requested_by,
                    "purge_tenant",
                    "tenant-data",
                    if summary.errors.is_empty() {
                        AuditResult::Success
                    } else {
                        AuditResult::Partial
                    },
                )
                .tenant(tenant_id.as_str())
                .detail(serde_json::to_value(&summary)?),
            )
            .await?;

        if summary.errors.is_empty() {
            info!(tenant_id = %tenant_id, "tenant purge completed");
        } else {
            error!(
                tenant_id = %tenant_id,
                errors = summary.errors.len(),
                "tenant purge completed with errors"
            );
        }
        Ok(summary)
    }

    async fn execute_method(
        &self,
        entry: &RetentionEntry,
        method: DeletionMethod,
        tenant_purge: bool,
    ) -> Result<(), CommonError> {
        let scope = TenantScope::new(entry.tenant_id.clone(), &entry.resource_type)?;
        match method {
            DeletionMethod::CryptoErasure => {
                if !tenant_purge {
                    self.ensure_safe_for_crypto_erasure(entry).await?;
                }
                self.registry
                    .destroy_key(&entry.tenant_id, MIN_DESTRUCTION_WINDOW_DAYS)
                    .await?;
                Ok(())
            }
            DeletionMethod::HardDelete => {
                self.documents
                    .delete_item(&scope, &entry.resource_id)
                    .await?;
                self.objects
                    .delete_prefix(&scope.object_prefix(&entry.resource_id))
                    .await?;
                // read back to prove the bytes are actually gone
                if self
                    .documents
                    .get_item(&scope, &entry.resource_id)
                    .await?
                    .is_some()
                {
                    return Err(CommonError::DeletionFailed {
                        msg: format!(
                            "resource '{}' still readable after hard delete",
                            entry.resource_id
                        ),
                        source: None,
                    });
                }
                Ok(())
            }
            DeletionMethod::SoftDelete => {
                self.documents
                    .mark_deleted(&scope, &entry.resource_id, Utc::now())
                    .await
            }
        }
    }

    /// Crypto-erasure destroys the tenant key, and the key may guard more
    /// than one category. Outside a whole-tenant purge it is only permitted
    /// when no other category still has live, unexpired data under the key.
    async fn ensure_safe_for_crypto_erasure(
        &self,
        entry: &RetentionEntry,
    ) -> Result<(), CommonError> {
        let now = Utc::now();
        let entries = self
            .ledger
            .list_entries_for_tenant(&entry.tenant_id)
            .await?;
        let blocking: Vec<&RetentionEntry> = entries
            .iter()
            .filter(|other| {
                other.category != entry.category
                    && other.status != RetentionEntryStatus::Deleted
                    && other.expires_at.is_none_or(|expiry| expiry > now)
            })
            .collect();
        if let Some(blocker) = blocking.first() {
            return Err(CommonError::RetentionPolicy {
                msg: format!(
                    "crypto-erasure refused: tenant key still guards unexpired '{}' data \
                     ({} blocking entries); offboard the tenant instead",
                    blocker.category.as_str(),
                    blocking.len()
                ),
            });
        }
        Ok(())
    }

    async fn mark_deleted(
        &self,
        entry: &RetentionEntry,
        method: DeletionMethod,
        reason: &str,
    ) -> Result<(), CommonError> {
        let mut updated = entry.clone();
        updated.status = RetentionEntryStatus::Deleted;
        updated.deleted_at = Some(Utc::now());
        updated.deletion_method = Some(method);
        updated.deletion_reason = Some(reason.to_string());
        self.ledger.put_entry(&updated).await
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::logic::policy::DataCategory;
    use crate::logic::test_support::Harness;
    use chrono::DateTime;
    use shared::identity::Role;
    use shared::tenant::TenantId;

    fn tenant() -> TenantId {
        TenantId::new("acme").unwrap()
    }

    async fn schedule(
        harness: &Harness,
        category: DataCategory,
        resource_type: &str,
        resource_id: &str,
        created_at: DateTime<Utc>,
    ) -> RetentionEntry {
        let retention_id = harness
            .scheduler
            .schedule(&tenant(), category, resource_type, resource_id, created_at)
            .await
            .unwrap();
        harness
            .ledger
            .get_entry(&retention_id)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_crypto_erasure_refused_while_key_guards_live_data() {
        let harness = Harness::new();
        harness.registry.get_or_create_key(&tenant()).await.unwrap();

        let phi = schedule(
            &harness,
            DataCategory::ProtectedHealthData,
            "scans",
            "scan-1",
            Utc::now() - chrono::Duration::days(2200),
        )
        .await;
        // billing data under the same tenant key, nowhere near expiry
        schedule(
            &harness,
            DataCategory::BillingData,
            "invoices",
            "inv-1",
            Utc::now(),
        )
        .await;

        let result = harness
            .executor
            .delete(&phi, DeletionMethod::CryptoErasure, "expiry", "system", false)
            .await;
        assert!(matches!(
            result,
            Err(CommonError::RetentionPolicy { .. })
        ));
        // key untouched
        let key = harness
            .registry
            .key_metadata(&tenant())
            .await
            .unwrap()
            .unwrap();
        assert!(key.state.is_usable());
    }

    #[tokio::test]
    async fn test_crypto_erasure_allowed_during_tenant_purge() {
        let harness = Harness::new();
        let key = harness.registry.get_or_create_key(&tenant()).await.unwrap();

        let phi = schedule(
            &harness,
            DataCategory::ProtectedHealthData,
            "scans",
            "scan-1",
            Utc::now() - chrono::Duration::days(2200),
        )
        .await;
        schedule(
            &harness,
            DataCategory::BillingData,
            "invoices",
            "inv-1",
            Utc::now(),
        )
        .await;

        harness
            .executor
            .delete(
                &phi,
                DeletionMethod::CryptoErasure,
                "tenant-offboarding",
                "admin-1",
                true,
            )
            .await
            .unwrap();

        assert_eq!(
            harness.key_service.pending_deletion_window(&key.key_id),
            Some(MIN_DESTRUCTION_WINDOW_DAYS)
        );
        let entry = harness
            .ledger
            .get_entry(&phi.retention_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.status, RetentionEntryStatus::Deleted);
        assert_eq!(entry.deletion_method, Some(DeletionMethod::CryptoErasure));
    }

    #[tokio::test]
    async fn test_hard_delete_removes_documents_and_objects() {
        let harness = Harness::new();
        let scope = TenantScope::new(tenant(), "logs").unwrap();
        harness
            .documents
            .put_item(&scope, "log-1", &serde_json::json!({"x": 1}))
            .await
            .unwrap();
        harness
            .objects
            .put_object(
                &format!("{}part-0", scope.object_prefix("log-1")),
                b"blob".to_vec(),
                None,
            )
            .await
            .unwrap();

        let entry = schedule(
            &harness,
            DataCategory::SystemLogs,
            "logs",
            "log-1",
            Utc::now() - chrono::Duration::days(400),
        )
        .await;
        harness
            .executor
            .delete(&entry, DeletionMethod::HardDelete, "expiry", "system", false)
            .await
            .unwrap();

        assert!(
            harness
                .documents
                .get_item(&scope, "log-1")
                .await
                .unwrap()
                .is_none()
        );
        assert!(
            harness
                .objects
                .list_keys(&scope.object_prefix("log-1"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_parks_item_and_alerts() {
        use shared::audit::AuditResult;
        use shared::storage::DocumentStoreLike;

        // a store whose deletes always fail with a transient error
        struct FailingDocumentStore;

        #[async_trait::async_trait]
        impl DocumentStoreLike for FailingDocumentStore {
            async fn put_item(
                &self,
                _scope: &TenantScope,
                _resource_id: &str,
                _document: &serde_json::Value,
            ) -> Result<(), CommonError> {
                Ok(())
            }
            async fn get_item(
                &self,
                _scope: &TenantScope,
                _resource_id: &str,
            ) -> Result<Option<serde_json::Value>, CommonError> {
                Ok(None)
            }
            async fn list_items(
                &self,
                _scope: &TenantScope,
                _limit: usize,
            ) -> Result<Vec<serde_json::Value>, CommonError> {
                Ok(Vec::new())
            }
            async fn delete_item(
                &self,
                _scope: &TenantScope,
                _resource_id: &str,
            ) -> Result<(), CommonError> {
                Err(CommonError::Repository {
                    msg: "store unavailable".to_string(),
                    source: None,
                })
            }
            async fn mark_deleted(
                &self,
                _scope: &TenantScope,
                _resource_id: &str,
                _deleted_at: chrono::DateTime<Utc>,
            ) -> Result<(), CommonError> {
                Ok(())
            }
        }

        let harness = Harness::new();
        let entry = schedule(
            &harness,
            DataCategory::SystemLogs,
            "logs",
            "log-1",
            Utc::now() - chrono::Duration::days(400),
        )
        .await;

        let executor = DeletionExecutor::new(
            harness.ledger.clone(),
            harness.queue.clone(),
            Arc::new(FailingDocumentStore),
            harness.objects.clone(),
            harness.registry.clone(),
            Arc::new(AccessGate::new(harness.audit.clone())),
            harness.audit.clone(),
        )
        .with_backoff(3, Duration::from_millis(2));

        let result = executor
            .delete(&entry, DeletionMethod::HardDelete, "expiry", "system", false)
            .await;
        assert!(matches!(result, Err(CommonError::DeletionFailed { .. })));

        let parked = harness
            .queue
            .list_by_status(DeletionQueueStatus::RetryNeeded)
            .await
            .unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].retry_count, 3);

        let alerts: Vec<_> = harness
            .audit
            .events_with_result(AuditResult::Error)
            .into_iter()
            .filter(|e| e.action == "deletion_retry_exhausted")
            .collect();
        assert_eq!(alerts.len(), 1);

        // the ledger row is untouched, not falsely marked deleted
        let unchanged = harness
            .ledger
            .get_entry(&entry.retention_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unchanged.status, RetentionEntryStatus::Active);
    }

    #[tokio::test]
    async fn test_purge_tenant_applies_category_methods_and_destroys_key() {
        use shared::storage::DELETED_MARKER;

        let harness = Harness::new();
        let key = harness.registry.get_or_create_key(&tenant()).await.unwrap();

        let scans = TenantScope::new(tenant(), "scans").unwrap();
        let invoices = TenantScope::new(tenant(), "invoices").unwrap();
        for (scope, id) in [(&scans, "scan-1"), (&invoices, "inv-1")] {
            harness
                .documents
                .put_item(scope, id, &serde_json::json!({"x": 1}))
                .await
                .unwrap();
        }
        schedule(
            &harness,
            DataCategory::ProtectedHealthData,
            "scans",
            "scan-1",
            Utc::now(),
        )
        .await;
        schedule(
            &harness,
            DataCategory::BillingData,
            "invoices",
            "inv-1",
            Utc::now(),
        )
        .await;
        schedule(
            &harness,
            DataCategory::AuditLogs,
            "audit",
            "audit-1",
            Utc::now(),
        )
        .await;

        let summary = harness
            .executor
            .purge_tenant(&tenant(), "customer-offboarding", "admin-1")
            .await
            .unwrap();

        assert!(summary.errors.is_empty(), "{:?}", summary.errors);
        assert!(summary.key_destroyed);
        assert_eq!(summary.items_deleted["protected-health-data"], 1);
        assert_eq!(summary.items_deleted["billing-data"], 1);
        assert!(!summary.items_deleted.contains_key("audit-logs"));

        // health data bytes removed, billing soft-deleted in place
        assert!(
            harness
                .documents
                .get_item(&scans, "scan-1")
                .await
                .unwrap()
                .is_none()
        );
        let invoice = harness
            .documents
            .get_item(&invoices, "inv-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(invoice[DELETED_MARKER], true);

        // key destruction scheduled, audit-log ledger entry still active
        assert_eq!(
            harness.key_service.pending_deletion_window(&key.key_id),
            Some(MIN_DESTRUCTION_WINDOW_DAYS)
        );
        let phi_entry = harness
            .ledger
            .get_entry("acme#scans#scan-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            phi_entry.deletion_method,
            Some(DeletionMethod::CryptoErasure)
        );
        let audit_entry = harness
            .ledger
            .get_entry("acme#audit#audit-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(audit_entry.status, RetentionEntryStatus::Active);
    }

    #[tokio::test]
    async fn test_approval_requires_permission() {
        let harness = Harness::new();
        let entry = schedule(
            &harness,
            DataCategory::BillingData,
            "invoices",
            "inv-1",
            Utc::now() - chrono::Duration::days(3700),
        )
        .await;
        let item = DeletionQueueItem::pending_approval(&entry, "expiry", "system");
        harness.queue.enqueue(&item).await.unwrap();

        let user = Actor::new("user-1", Role::CustomerUser);
        let result = harness.executor.approve(&user, &item.queue_id).await;
        assert!(matches!(
            result,
            Err(CommonError::PermissionDenied { .. })
        ));
        // still queued, nothing executed
        assert!(harness.queue.get(&item.queue_id).await.unwrap().is_some());
    }
}
