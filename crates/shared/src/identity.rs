use serde::{Deserialize, Serialize};

/// Caller role in the system. The role→permission table is fixed; there is no
/// per-tenant customization of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    CustomerUser,
    CustomerAdmin,
    SystemOperator,
    ReadonlyAnalyst,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::CustomerUser => "customer_user",
            Role::CustomerAdmin => "customer_admin",
            Role::SystemOperator => "system_operator",
            Role::ReadonlyAnalyst => "readonly_analyst",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "customer_user" => Some(Role::CustomerUser),
            "customer_admin" => Some(Role::CustomerAdmin),
            "system_operator" => Some(Role::SystemOperator),
            "readonly_analyst" => Some(Role::ReadonlyAnalyst),
            _ => None,
        }
    }

    /// Static permission set for this role.
    ///
    /// `SystemOperator` holds no tenant-data permissions at all: operators
    /// administer the platform, they never read or write tenant data.
    /// `ReadonlyAnalyst` only ever sees aggregated, anonymized views, which
    /// are produced outside this subsystem.
    pub fn permissions(&self) -> &'static [Permission] {
        match self {
            Role::CustomerUser => &[Permission::ReadOwnData, Permission::WriteOwnData],
            Role::CustomerAdmin => &[
                Permission::ReadOwnData,
                Permission::WriteOwnData,
                Permission::ReadTenantData,
                Permission::WriteTenantData,
                Permission::DeleteTenantData,
                Permission::ExportTenantData,
                Permission::ApproveDeletion,
            ],
            Role::SystemOperator => &[],
            Role::ReadonlyAnalyst => &[],
        }
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ReadOwnData,
    WriteOwnData,
    ReadTenantData,
    WriteTenantData,
    DeleteTenantData,
    ExportTenantData,
    ApproveDeletion,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadOwnData => "read_own_data",
            Permission::WriteOwnData => "write_own_data",
            Permission::ReadTenantData => "read_tenant_data",
            Permission::WriteTenantData => "write_tenant_data",
            Permission::DeleteTenantData => "delete_tenant_data",
            Permission::ExportTenantData => "export_tenant_data",
            Permission::ApproveDeletion => "approve_deletion",
        }
    }
}

/// An authenticated caller as seen by this subsystem. Authentication itself
/// happens upstream; by the time an `Actor` reaches the core it is trusted to
/// be who it says it is, and only authorization remains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    pub role: Role,
}

impl Actor {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;

    #[test]
    fn test_customer_admin_holds_all_tenant_permissions() {
        for permission in [
            Permission::ReadTenantData,
            Permission::WriteTenantData,
            Permission::DeleteTenantData,
            Permission::ExportTenantData,
            Permission::ApproveDeletion,
        ] {
            assert!(Role::CustomerAdmin.has_permission(permission));
        }
    }

    #[test]
    fn test_customer_user_limited_to_own_data() {
        assert!(Role::CustomerUser.has_permission(Permission::ReadOwnData));
        assert!(Role::CustomerUser.has_permission(Permission::WriteOwnData));
        assert!(!Role::CustomerUser.has_permission(Permission::ReadTenantData));
        assert!(!Role::CustomerUser.has_permission(Permission::DeleteTenantData));
    }

    #[test]
    fn test_system_operator_denied_all_tenant_data() {
        assert!(Role::SystemOperator.permissions().is_empty());
        for permission in [
            Permission::ReadOwnData,
            Permission::ReadTenantData,
            Permission::WriteTenantData,
            Permission::DeleteTenantData,
            Permission::ExportTenantData,
        ] {
            assert!(!Role::SystemOperator.has_permission(permission));
        }
    }

    #[test]
    fn test_readonly_analyst_denied_raw_data() {
        assert!(Role::ReadonlyAnalyst.permissions().is_empty());
    }

    #[test]
    fn test_role_round_trips_through_strings() {
        for role in [
            Role::CustomerUser,
            Role::CustomerAdmin,
            Role::SystemOperator,
            Role::ReadonlyAnalyst,
        ] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("superuser"), None);
    }
}
