use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CommonError;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Validate an identifier that will be interpolated into table names, object
/// keys and key aliases. Lowercase alphanumerics and hyphens only, so no
/// identifier can smuggle separators or path segments into derived storage
/// addresses.
pub fn validate_identifier(value: &str, what: &str) -> Result<(), CommonError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(CommonError::InvalidRequest {
            msg: format!("{what} must be 1..={MAX_IDENTIFIER_LEN} characters, got {}", value.len()),
            source: None,
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(CommonError::InvalidRequest {
            msg: format!("{what} '{value}' may only contain lowercase alphanumerics and hyphens"),
            source: None,
        });
    }
    if value.starts_with('-') || value.ends_with('-') {
        return Err(CommonError::InvalidRequest {
            msg: format!("{what} '{value}' may not start or end with a hyphen"),
            source: None,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Result<Self, CommonError> {
        let value = value.into();
        validate_identifier(&value, "tenant id")?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key-service alias for this tenant's encryption key.
    pub fn key_alias(&self) -> String {
        format!("alias/tenant-{}-key", self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantId::new(s)
    }
}

/// Addresses one tenant-scoped resource type. All storage identifiers are
/// derived from here, never assembled ad hoc at call sites, and both parts
/// are validated once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantScope {
    tenant_id: TenantId,
    resource_type: String,
}

impl TenantScope {
    pub fn new(tenant_id: TenantId, resource_type: impl Into<String>) -> Result<Self, CommonError> {
        let resource_type = resource_type.into();
        validate_identifier(&resource_type, "resource type")?;
        Ok(Self {
            tenant_id,
            resource_type,
        })
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Document-store table for this scope.
    pub fn table_name(&self) -> String {
        format!("customer-{}-{}", self.tenant_id, self.resource_type)
    }

    /// Object-store prefix for one resource in this scope.
    pub fn object_prefix(&self, resource_id: &str) -> String {
        format!(
            "customers/{}/{}/{}/",
            self.tenant_id, self.resource_type, resource_id
        )
    }

    /// Object-store prefix covering everything the tenant owns.
    pub fn tenant_prefix(&self) -> String {
        tenant_object_prefix(&self.tenant_id)
    }
}

/// Object-store prefix covering everything a tenant owns, independent of any
/// one resource type.
pub fn tenant_object_prefix(tenant_id: &TenantId) -> String {
    format!("customers/{tenant_id}/")
}
