//! Role-gated access control for tenant data operations.
//!
//! Every public entry point that touches tenant data calls
//! [`AccessGate::require`] before doing anything else. A denial raises before
//! any engine or key-registry call executes and is itself audited; successful
//! operations audit their final outcome at completion, so every attempt
//! produces exactly one audit record.

use std::sync::Arc;

use crate::audit::{AuditEvent, AuditResult, AuditSinkLike};
use crate::error::CommonError;
use crate::identity::{Actor, Permission};
use crate::tenant::TenantId;

pub struct AccessGate {
    audit: Arc<dyn AuditSinkLike>,
}

impl AccessGate {
    pub fn new(audit: Arc<dyn AuditSinkLike>) -> Self {
        Self { audit }
    }

    /// Pure table lookup, no side effects.
    pub fn check(&self, actor: &Actor, permission: Permission) -> bool {
        actor.role.has_permission(permission)
    }

    /// Authorize `actor` for `permission` or fail closed.
    ///
    /// On denial this emits the one audit record for the attempt and returns
    /// `PermissionDenied`; the caller must not run any part of the operation.
    pub async fn require(
        &self,
        actor: &Actor,
        permission: Permission,
        action: &str,
        tenant_id: &TenantId,
        resource_type: &str,
        resource_id: Option<&str>,
    ) -> Result<(), CommonError> {
        if self.check(actor, permission) {
            return Ok(());
        }

        let mut event = AuditEvent::new(&actor.id, action, resource_type, AuditResult::Denied)
            .tenant(tenant_id.as_str())
            .error_message(format!(
                "role '{}' lacks permission '{}'",
                actor.role.as_str(),
                permission.as_str()
            ));
        if let Some(resource_id) = resource_id {
            event = event.resource(resource_id);
        }
        self.audit.emit(event).await?;

        Err(CommonError::PermissionDenied {
            msg: format!(
                "permission '{}' required for '{}'",
                permission.as_str(),
                action
            ),
        })
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::identity::Role;

    fn gate_with_sink() -> (AccessGate, Arc<MemoryAuditSink>) {
        let sink = MemoryAuditSink::new();
        (AccessGate::new(sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_allowed_call_emits_no_gate_event() {
        let (gate, sink) = gate_with_sink();
        let actor = Actor::new("admin-1", Role::CustomerAdmin);
        let tenant = TenantId::new("acme").unwrap();

        gate.require(
            &actor,
            Permission::ReadTenantData,
            "get_record",
            &tenant,
            "scans",
            Some("scan-1"),
        )
        .await
        .unwrap();

        // the operation itself audits its outcome; the gate stays silent
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_denied_call_raises_and_audits_once() {
        let (gate, sink) = gate_with_sink();
        let actor = Actor::new("analyst-1", Role::ReadonlyAnalyst);
        let tenant = TenantId::new("acme").unwrap();

        let err = gate
            .require(
                &actor,
                Permission::ReadTenantData,
                "get_record",
                &tenant,
                "scans",
                Some("scan-1"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CommonError::PermissionDenied { .. }));
        let denied = sink.events_with_result(AuditResult::Denied);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].actor, "analyst-1");
        assert_eq!(denied[0].action, "get_record");
        assert_eq!(sink.events().len(), 1);
    }

    #[tokio::test]
    async fn test_system_operator_has_no_bypass() {
        let (gate, sink) = gate_with_sink();
        let actor = Actor::new("ops-1", Role::SystemOperator);
        let tenant = TenantId::new("acme").unwrap();

        for permission in [
            Permission::ReadTenantData,
            Permission::WriteTenantData,
            Permission::DeleteTenantData,
            Permission::ExportTenantData,
        ] {
            let result = gate
                .require(&actor, permission, "op", &tenant, "scans", None)
                .await;
            assert!(matches!(
                result,
                Err(CommonError::PermissionDenied { .. })
            ));
        }
        assert_eq!(sink.events_with_result(AuditResult::Denied).len(), 4);
    }
}
