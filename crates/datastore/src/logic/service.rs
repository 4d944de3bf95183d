// Tenant data service: the one entry surface for protected records. Every
// operation goes gate → engine → storage → retention ledger, in that order,
// and audits its outcome. Nothing here touches plaintext after an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use encryption::logic::envelope::{EncryptedRecord, EnvelopeEngine};
use retention::logic::executor::{DeletionExecutor, TenantPurgeSummary};
use retention::logic::policy::{DataCategory, DeletionMethod};
use retention::logic::scheduler::{RetentionEntry, RetentionScheduler, RetentionStatus};
use retention::repository::RetentionLedgerLike;
use serde::Serialize;
use shared::audit::{AuditEvent, AuditResult, AuditSinkLike};
use shared::authz::AccessGate;
use shared::error::CommonError;
use shared::identity::{Actor, Permission};
use shared::storage::{DELETED_MARKER, DocumentStoreLike, ObjectStoreLike};
use shared::tenant::{TenantId, TenantScope, validate_identifier};
use tracing::warn;

/// Export bundles expire out of the object store after this many days.
pub const EXPORT_BUNDLE_EXPIRY_DAYS: i64 = 7;

/// Export download links are presigned for at most this long.
pub const EXPORT_URL_VALIDITY: Duration = Duration::from_secs(3600);

const LIST_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize)]
struct ExportBundle {
    tenant_id: TenantId,
    export_id: String,
    exported_at: chrono::DateTime<Utc>,
    exported_by: String,
    resource_type: String,
    records: Vec<serde_json::Value>,
}

pub struct TenantDataService {
    gate: Arc<AccessGate>,
    engine: Arc<EnvelopeEngine>,
    scheduler: Arc<RetentionScheduler>,
    executor: Arc<DeletionExecutor>,
    documents: Arc<dyn DocumentStoreLike>,
    objects: Arc<dyn ObjectStoreLike>,
    audit: Arc<dyn AuditSinkLike>,
}

impl TenantDataService {
    pub fn new(
        gate: Arc<AccessGate>,
        engine: Arc<EnvelopeEngine>,
        scheduler: Arc<RetentionScheduler>,
        executor: Arc<DeletionExecutor>,
        documents: Arc<dyn DocumentStoreLike>,
        objects: Arc<dyn ObjectStoreLike>,
        audit: Arc<dyn AuditSinkLike>,
    ) -> Self {
        Self {
            gate,
            engine,
            scheduler,
            executor,
            documents,
            objects,
            audit,
        }
    }

    async fn audit_outcome(
        &self,
        actor: &Actor,
        action: &str,
        scope: &TenantScope,
        resource_id: Option<&str>,
        result: AuditResult,
        error: Option<String>,
    ) -> Result<(), CommonError> {
        let mut event = AuditEvent::new(&actor.id, action, scope.resource_type(), result)
            .tenant(scope.tenant_id().as_str());
        if let Some(resource_id) = resource_id {
            event = event.resource(resource_id);
        }
        if let Some(error) = error {
            event = event.error_message(error);
        }
        self.audit.emit(event).await
    }

    /// Encrypt and persist a record, classifying it for retention.
    pub async fn store_record(
        &self,
        actor: &Actor,
        scope: &TenantScope,
        category: DataCategory,
        record: &serde_json::Value,
        resource_id: Option<String>,
    ) -> Result<String, CommonError> {
        self.gate
            .require(
                actor,
                Permission::WriteTenantData,
                "store_record",
                scope.tenant_id(),
                scope.resource_type(),
                resource_id.as_deref(),
            )
            .await?;

        let resource_id = match resource_id {
            Some(id) => {
                validate_identifier(&id, "resource id")?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let result = async {
            let encrypted = self
                .engine
                .encrypt(scope.tenant_id(), record, scope.resource_type(), &actor.id)
                .await?;
            self.documents
                .put_item(scope, &resource_id, &serde_json::to_value(&encrypted)?)
                .await?;
            self.scheduler
                .schedule(
                    scope.tenant_id(),
                    category,
                    scope.resource_type(),
                    &resource_id,
                    Utc::now(),
                )
                .await?;
            Ok::<_, CommonError>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.audit_outcome(
                    actor,
                    "store_record",
                    scope,
                    Some(&resource_id),
                    AuditResult::Success,
                    None,
                )
                .await?;
                Ok(resource_id)
            }
            Err(err) => {
                self.audit_outcome(
                    actor,
                    "store_record",
                    scope,
                    Some(&resource_id),
                    AuditResult::Error,
                    Some(err.to_string()),
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Fetch and decrypt one record. Soft-deleted records read as absent.
    pub async fn get_record(
        &self,
        actor: &Actor,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>, CommonError> {
        self.gate
            .require(
                actor,
                Permission::ReadTenantData,
                "get_record",
                scope.tenant_id(),
                scope.resource_type(),
                Some(resource_id),
            )
            .await?;

        let Some(stored) = self.documents.get_item(scope, resource_id).await? else {
            self.audit_outcome(
                actor,
                "get_record",
                scope,
                Some(resource_id),
                AuditResult::NotFound,
                None,
            )
            .await?;
            return Ok(None);
        };
        if stored.get(DELETED_MARKER).and_then(|v| v.as_bool()) == Some(true) {
            self.audit_outcome(
                actor,
                "get_record",
                scope,
                Some(resource_id),
                AuditResult::NotFound,
                None,
            )
            .await?;
            return Ok(None);
        }

        let result = async {
            let encrypted: EncryptedRecord = serde_json::from_value(stored)?;
            self.engine
                .decrypt::<serde_json::Value>(scope.tenant_id(), &encrypted, "data-retrieval")
                .await
        }
        .await;

        match result {
            Ok(value) => {
                self.audit_outcome(
                    actor,
                    "get_record",
                    scope,
                    Some(resource_id),
                    AuditResult::Success,
                    None,
                )
                .await?;
                Ok(Some(value))
            }
            Err(err) => {
                self.audit_outcome(
                    actor,
                    "get_record",
                    scope,
                    Some(resource_id),
                    AuditResult::Error,
                    Some(err.to_string()),
                )
                .await?;
                Err(err)
            }
        }
    }

    /// List and decrypt records in a scope. Records that fail to decrypt are
    /// skipped with a warning rather than failing the whole listing.
    pub async fn list_records(
        &self,
        actor: &Actor,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, CommonError> {
        self.gate
            .require(
                actor,
                Permission::ReadTenantData,
                "list_records",
                scope.tenant_id(),
                scope.resource_type(),
                None,
            )
            .await?;

        let stored = self
            .documents
            .list_items(scope, limit.min(LIST_LIMIT))
            .await?;
        let mut records = Vec::new();
        let mut skipped = 0usize;
        for item in stored {
            if item.get(DELETED_MARKER).and_then(|v| v.as_bool()) == Some(true) {
                continue;
            }
            let decrypted = async {
                let encrypted: EncryptedRecord = serde_json::from_value(item)?;
                self.engine
                    .decrypt::<serde_json::Value>(scope.tenant_id(), &encrypted, "data-listing")
                    .await
            }
            .await;
            match decrypted {
                Ok(value) => records.push(value),
                Err(err) => {
                    skipped += 1;
                    warn!(
                        tenant_id = %scope.tenant_id(),
                        resource_type = scope.resource_type(),
                        error = %err,
                        "skipping undecryptable record in listing"
                    );
                }
            }
        }

        self.audit_outcome(
            actor,
            "list_records",
            scope,
            None,
            if skipped == 0 {
                AuditResult::Success
            } else {
                AuditResult::Partial
            },
            None,
        )
        .await?;
        Ok(records)
    }

    /// Delete one record on customer request, honoring its retention method.
    ///
    /// Soft-delete categories are marked in place; everything else has its
    /// bytes removed. Per-resource requests never destroy the tenant key;
    /// crypto-erasure only happens through [`Self::purge_tenant`].
    pub async fn delete_record(
        &self,
        actor: &Actor,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<bool, CommonError> {
        self.gate
            .require(
                actor,
                Permission::DeleteTenantData,
                "delete_record",
                scope.tenant_id(),
                scope.resource_type(),
                Some(resource_id),
            )
            .await?;

        let retention_id = RetentionEntry::retention_id_for(
            scope.tenant_id(),
            scope.resource_type(),
            resource_id,
        );
        let entry = self.scheduler.ledger().get_entry(&retention_id).await?;
        let exists = self.documents.get_item(scope, resource_id).await?.is_some();
        if entry.is_none() && !exists {
            self.audit_outcome(
                actor,
                "delete_record",
                scope,
                Some(resource_id),
                AuditResult::NotFound,
                None,
            )
            .await?;
            return Ok(false);
        }

        match entry {
            Some(entry) => {
                let method = match entry.method {
                    DeletionMethod::SoftDelete => DeletionMethod::SoftDelete,
                    // single-resource deletion removes ciphertext bytes; the
                    // tenant key stays because it guards everything else
                    _ => DeletionMethod::HardDelete,
                };
                self.executor
                    .delete(&entry, method, "customer-request", &actor.id, false)
                    .await?;
            }
            None => {
                // untracked resource, remove the bytes directly
                self.documents.delete_item(scope, resource_id).await?;
                self.objects
                    .delete_prefix(&scope.object_prefix(resource_id))
                    .await?;
                self.audit_outcome(
                    actor,
                    "delete_record",
                    scope,
                    Some(resource_id),
                    AuditResult::Success,
                    None,
                )
                .await?;
            }
        }
        Ok(true)
    }

    /// Build an encrypted export bundle and return a time-limited download
    /// URL. The bundle itself expires out of the object store after
    /// [`EXPORT_BUNDLE_EXPIRY_DAYS`].
    pub async fn export_records(
        &self,
        actor: &Actor,
        scope: &TenantScope,
    ) -> Result<String, CommonError> {
        self.gate
            .require(
                actor,
                Permission::ExportTenantData,
                "export_records",
                scope.tenant_id(),
                scope.resource_type(),
                None,
            )
            .await?;

        let export_id = uuid::Uuid::new_v4().to_string();
        let result = async {
            let records = self.collect_for_export(scope).await?;
            let bundle = ExportBundle {
                tenant_id: scope.tenant_id().clone(),
                export_id: export_id.clone(),
                exported_at: Utc::now(),
                exported_by: actor.id.clone(),
                resource_type: scope.resource_type().to_string(),
                records,
            };
            let encrypted = self
                .engine
                .encrypt(scope.tenant_id(), &bundle, "data-export", &actor.id)
                .await?;

            let key = format!("{}exports/{export_id}.json.enc", scope.tenant_prefix());
            self.objects
                .put_object(
                    &key,
                    serde_json::to_vec(&encrypted)?,
                    Some(Utc::now() + ChronoDuration::days(EXPORT_BUNDLE_EXPIRY_DAYS)),
                )
                .await?;
            self.objects.presigned_get_url(&key, EXPORT_URL_VALIDITY).await
        }
        .await;

        match result {
            Ok(url) => {
                self.audit_outcome(
                    actor,
                    "export_records",
                    scope,
                    Some(&export_id),
                    AuditResult::Success,
                    None,
                )
                .await?;
                Ok(url)
            }
            Err(err) => {
                self.audit_outcome(
                    actor,
                    "export_records",
                    scope,
                    Some(&export_id),
                    AuditResult::Error,
                    Some(err.to_string()),
                )
                .await?;
                Err(err)
            }
        }
    }

    /// Per-tenant retention summary.
    pub async fn retention_status(
        &self,
        actor: &Actor,
        tenant_id: &TenantId,
    ) -> Result<RetentionStatus, CommonError> {
        let scope = TenantScope::new(tenant_id.clone(), "retention-ledger")?;
        self.gate
            .require(
                actor,
                Permission::ReadTenantData,
                "retention_status",
                tenant_id,
                scope.resource_type(),
                None,
            )
            .await?;
        self.scheduler.status(tenant_id).await
    }

    /// Right-to-be-forgotten: remove every non-audit-log resource the tenant
    /// owns and destroy its key.
    pub async fn purge_tenant(
        &self,
        actor: &Actor,
        tenant_id: &TenantId,
        reason: &str,
    ) -> Result<TenantPurgeSummary, CommonError> {
        let scope = TenantScope::new(tenant_id.clone(), "tenant-data")?;
        self.gate
            .require(
                actor,
                Permission::DeleteTenantData,
                "purge_tenant",
                tenant_id,
                scope.resource_type(),
                None,
            )
            .await?;
        self.executor
            .purge_tenant(tenant_id, reason, &actor.id)
            .await
    }

    async fn collect_for_export(
        &self,
        scope: &TenantScope,
    ) -> Result<Vec<serde_json::Value>, CommonError> {
        let stored = self.documents.list_items(scope, LIST_LIMIT).await?;
        let mut records = Vec::new();
        for item in stored {
            if item.get(DELETED_MARKER).and_then(|v| v.as_bool()) == Some(true) {
                continue;
            }
            let decrypted = async {
                let encrypted: EncryptedRecord = serde_json::from_value(item)?;
                self.engine
                    .decrypt::<serde_json::Value>(scope.tenant_id(), &encrypted, "data-export")
                    .await
            }
            .await;
            match decrypted {
                Ok(value) => records.push(value),
                Err(err) => warn!(
                    tenant_id = %scope.tenant_id(),
                    error = %err,
                    "skipping undecryptable record in export"
                ),
            }
        }
        Ok(records)
    }
}
