// Retention classification and scheduling. Every protected resource gets a
// ledger row at creation time; expiry is computed once from the policy table
// and extensions append to an immutable history instead of overwriting it.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use shared::audit::{AuditEvent, AuditResult, AuditSinkLike};
use shared::error::CommonError;
use shared::tenant::TenantId;
use tracing::info;

use crate::logic::policy::{
    AuditLevel, DataCategory, DeletionMethod, RetentionPolicyTag, policy_for,
};
use crate::repository::RetentionLedgerLike;

/// Window ahead of expiry in which entries are reported as expiring soon.
pub const EXPIRING_SOON_WINDOW_DAYS: i64 = 30;

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionEntryStatus {
    Active,
    PendingApproval,
    Deleted,
}

impl RetentionEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionEntryStatus::Active => "active",
            RetentionEntryStatus::PendingApproval => "pending-approval",
            RetentionEntryStatus::Deleted => "deleted",
        }
    }
}

/// One retention extension, kept forever on the entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionExtension {
    pub extended_by: String,
    pub extended_at: DateTime<Utc>,
    pub reason: String,
    pub previous_expires_at: Option<DateTime<Utc>>,
    pub new_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionEntry {
    /// `<tenant>#<resource_type>#<resource_id>`
    pub retention_id: String,
    pub tenant_id: TenantId,
    pub category: DataCategory,
    pub resource_type: String,
    pub resource_id: String,
    pub created_at: DateTime<Utc>,
    /// None means indefinite retention.
    pub expires_at: Option<DateTime<Utc>>,
    pub policy_tag: RetentionPolicyTag,
    pub method: DeletionMethod,
    pub requires_approval: bool,
    pub audit_level: AuditLevel,
    pub status: RetentionEntryStatus,
    pub scheduled_at: DateTime<Utc>,
    pub last_reviewed_at: DateTime<Utc>,
    pub extensions: Vec<RetentionExtension>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deletion_method: Option<DeletionMethod>,
    pub deletion_reason: Option<String>,
}

impl RetentionEntry {
    pub fn retention_id_for(tenant_id: &TenantId, resource_type: &str, resource_id: &str) -> String {
        format!("{tenant_id}#{resource_type}#{resource_id}")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, RetentionEntryStatus::Active)
            && self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CategoryCounts {
    pub count: usize,
    pub active: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiringItem {
    pub retention_id: String,
    pub resource_type: String,
    pub expires_at: DateTime<Utc>,
    pub days_until_expiry: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpiredItem {
    pub retention_id: String,
    pub resource_type: String,
    pub expires_at: DateTime<Utc>,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndefiniteItem {
    pub retention_id: String,
    pub resource_type: String,
    pub created_at: DateTime<Utc>,
}

/// Per-tenant retention summary.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionStatus {
    pub tenant_id: TenantId,
    pub total_items: usize,
    pub by_category: BTreeMap<String, CategoryCounts>,
    pub expiring_soon: Vec<ExpiringItem>,
    pub expired: Vec<ExpiredItem>,
    pub indefinite: Vec<IndefiniteItem>,
    pub generated_at: DateTime<Utc>,
}

pub struct RetentionScheduler {
    ledger: Arc<dyn RetentionLedgerLike>,
    audit: Arc<dyn AuditSinkLike>,
}

impl RetentionScheduler {
    pub fn new(ledger: Arc<dyn RetentionLedgerLike>, audit: Arc<dyn AuditSinkLike>) -> Self {
        Self { ledger, audit }
    }

    pub fn ledger(&self) -> &Arc<dyn RetentionLedgerLike> {
        &self.ledger
    }

    /// Classify a newly persisted resource and write its ledger row.
    pub async fn schedule(
        &self,
        tenant_id: &TenantId,
        category: DataCategory,
        resource_type: &str,
        resource_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<String, CommonError> {
        let policy = policy_for(category);
        let expires_at = policy
            .retention_days
            .map(|days| created_at + Duration::days(days));
        let now = Utc::now();

        let entry = RetentionEntry {
            retention_id: RetentionEntry::retention_id_for(tenant_id, resource_type, resource_id),
            tenant_id: tenant_id.clone(),
            category,
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            created_at,
            expires_at,
            policy_tag: policy.tag,
            method: policy.method,
            requires_approval: policy.requires_approval,
            audit_level: policy.audit_level,
            status: RetentionEntryStatus::Active,
            scheduled_at: now,
            last_reviewed_at: now,
            extensions: Vec::new(),
            deleted_at: None,
            deletion_method: None,
            deletion_reason: None,
        };

        let result = self.ledger.put_entry(&entry).await;
        let audit_event = AuditEvent::new(
            SYSTEM_ACTOR,
            "schedule_retention",
            resource_type,
            if result.is_ok() {
                AuditResult::Success
            } else {
                AuditResult::Error
            },
        )
        .tenant(tenant_id.as_str())
        .resource(resource_id)
        .detail(serde_json::json!({
            "data_category": category.as_str(),
            "retention_policy": policy.tag.as_str(),
            "expires_at": expires_at.map(|e| e.to_rfc3339()),
        }));
        let audit_event = match &result {
            Ok(()) => audit_event,
            Err(err) => audit_event.error_message(err.to_string()),
        };
        self.audit.emit(audit_event).await?;
        result?;

        info!(
            tenant_id = %tenant_id,
            retention_id = %entry.retention_id,
            category = category.as_str(),
            "scheduled retention"
        );
        Ok(entry.retention_id)
    }

    /// Extend retention, preserving the prior expiry in the entry's history.
    pub async fn extend(
        &self,
        retention_id: &str,
        new_expires_at: DateTime<Utc>,
        extended_by: &str,
        reason: &str,
    ) -> Result<bool, CommonError> {
        let mut entry = self
            .ledger
            .get_entry(retention_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: "retention entry not found".to_string(),
                lookup_id: retention_id.to_string(),
                source: None,
            })?;
        if entry.status == RetentionEntryStatus::Deleted {
            return Err(CommonError::RetentionPolicy {
                msg: format!("retention entry '{retention_id}' is already deleted"),
            });
        }

        let now = Utc::now();
        entry.extensions.push(RetentionExtension {
            extended_by: extended_by.to_string(),
            extended_at: now,
            reason: reason.to_string(),
            previous_expires_at: entry.expires_at,
            new_expires_at,
        });
        entry.expires_at = Some(new_expires_at);
        entry.last_reviewed_at = now;
        self.ledger.put_entry(&entry).await?;

        self.audit
            .emit(
                AuditEvent::new(
                    extended_by,
                    "extend_retention",
                    &entry.resource_type,
                    AuditResult::Success,
                )
                .tenant(entry.tenant_id.as_str())
                .resource(&entry.resource_id)
                .detail(serde_json::json!({
                    "retention_id": retention_id,
                    "new_expires_at": new_expires_at.to_rfc3339(),
                    "reason": reason,
                })),
            )
            .await?;
        Ok(true)
    }

    /// Summary of everything the ledger tracks for one tenant.
    pub async fn status(&self, tenant_id: &TenantId) -> Result<RetentionStatus, CommonError> {
        let entries = self.ledger.list_entries_for_tenant(tenant_id).await?;
        let now = Utc::now();

        let mut status = RetentionStatus {
            tenant_id: tenant_id.clone(),
            total_items: entries.len(),
            by_category: BTreeMap::new(),
            expiring_soon: Vec::new(),
            expired: Vec::new(),
            indefinite: Vec::new(),
            generated_at: now,
        };

        for entry in &entries {
            let counts = status
                .by_category
                .entry(entry.category.as_str().to_string())
                .or_default();
            counts.count += 1;

            match entry.expires_at {
                Some(expires_at) if expires_at <= now => {
                    counts.expired += 1;
                    status.expired.push(ExpiredItem {
                        retention_id: entry.retention_id.clone(),
                        resource_type: entry.resource_type.clone(),
                        expires_at,
                        requires_approval: entry.requires_approval,
                    });
                }
                Some(expires_at)
                    if expires_at <= now + Duration::days(EXPIRING_SOON_WINDOW_DAYS) =>
                {
                    counts.active += 1;
                    status.expiring_soon.push(ExpiringItem {
                        retention_id: entry.retention_id.clone(),
                        resource_type: entry.resource_type.clone(),
                        expires_at,
                        days_until_expiry: (expires_at - now).num_days(),
                    });
                }
                Some(_) => counts.active += 1,
                None => {
                    counts.active += 1;
                    status.indefinite.push(IndefiniteItem {
                        retention_id: entry.retention_id.clone(),
                        resource_type: entry.resource_type.clone(),
                        created_at: entry.created_at,
                    });
                }
            }
        }
        Ok(status)
    }
}
