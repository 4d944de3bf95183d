// Static retention policy table. Every stored resource is classified into a
// data category at creation time; the category alone decides how long the
// data lives, how it is destroyed, and whether a human signs off first.

use serde::{Deserialize, Serialize};
use shared::error::CommonError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataCategory {
    ProtectedHealthData,
    AuditLogs,
    SystemLogs,
    BillingData,
    AccountData,
    AnonymizedAnalytics,
}

impl DataCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataCategory::ProtectedHealthData => "protected-health-data",
            DataCategory::AuditLogs => "audit-logs",
            DataCategory::SystemLogs => "system-logs",
            DataCategory::BillingData => "billing-data",
            DataCategory::AccountData => "account-data",
            DataCategory::AnonymizedAnalytics => "anonymized-analytics",
        }
    }

    pub fn parse(s: &str) -> Result<DataCategory, CommonError> {
        match s {
            "protected-health-data" => Ok(DataCategory::ProtectedHealthData),
            "audit-logs" => Ok(DataCategory::AuditLogs),
            "system-logs" => Ok(DataCategory::SystemLogs),
            "billing-data" => Ok(DataCategory::BillingData),
            "account-data" => Ok(DataCategory::AccountData),
            "anonymized-analytics" => Ok(DataCategory::AnonymizedAnalytics),
            other => Err(CommonError::RetentionPolicy {
                msg: format!("unknown data category '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicyTag {
    /// Regulatory minimum for protected health data (6 years).
    RegulatoryMinimum,
    /// Extended retention for audit and tax obligations (10 years).
    Extended,
    /// Kept until the customer asks for deletion.
    Indefinite,
    ShortTerm,
}

impl RetentionPolicyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetentionPolicyTag::RegulatoryMinimum => "regulatory-minimum",
            RetentionPolicyTag::Extended => "extended",
            RetentionPolicyTag::Indefinite => "indefinite",
            RetentionPolicyTag::ShortTerm => "short-term",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletionMethod {
    /// Destroy the tenant key guarding the ciphertext; bytes stay, meaning
    /// leaves. Only safe paired with whole-tenant deletion.
    CryptoErasure,
    /// Physically remove the stored bytes.
    HardDelete,
    /// Mark unavailable in place, bytes retained under separate obligations.
    SoftDelete,
}

impl DeletionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionMethod::CryptoErasure => "crypto-erasure",
            DeletionMethod::HardDelete => "hard-delete",
            DeletionMethod::SoftDelete => "soft-delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditLevel {
    Minimal,
    Standard,
    Comprehensive,
}

#[derive(Debug, Clone, Copy)]
pub struct CategoryPolicy {
    pub tag: RetentionPolicyTag,
    /// None means indefinite retention.
    pub retention_days: Option<i64>,
    pub method: DeletionMethod,
    pub requires_approval: bool,
    pub audit_level: AuditLevel,
}

/// The policy table. Fixed at compile time; regulation changes ship as code
/// changes, not configuration drift.
pub const fn policy_for(category: DataCategory) -> CategoryPolicy {
    match category {
        DataCategory::ProtectedHealthData => CategoryPolicy {
            tag: RetentionPolicyTag::RegulatoryMinimum,
            retention_days: Some(2190), // 6 years
            method: DeletionMethod::CryptoErasure,
            requires_approval: true,
            audit_level: AuditLevel::Comprehensive,
        },
        DataCategory::AuditLogs => CategoryPolicy {
            tag: RetentionPolicyTag::Extended,
            retention_days: Some(3650), // 10 years
            method: DeletionMethod::HardDelete,
            requires_approval: true,
            audit_level: AuditLevel::Comprehensive,
        },
        DataCategory::SystemLogs => CategoryPolicy {
            tag: RetentionPolicyTag::ShortTerm,
            retention_days: Some(365),
            method: DeletionMethod::HardDelete,
            requires_approval: false,
            audit_level: AuditLevel::Standard,
        },
        DataCategory::BillingData => CategoryPolicy {
            tag: RetentionPolicyTag::Extended,
            retention_days: Some(3650), // tax requirements
            method: DeletionMethod::SoftDelete,
            requires_approval: true,
            audit_level: AuditLevel::Comprehensive,
        },
        DataCategory::AccountData => CategoryPolicy {
            tag: RetentionPolicyTag::Indefinite,
            retention_days: None, // until the customer requests deletion
            method: DeletionMethod::HardDelete,
            requires_approval: false,
            audit_level: AuditLevel::Standard,
        },
        DataCategory::AnonymizedAnalytics => CategoryPolicy {
            tag: RetentionPolicyTag::ShortTerm,
            retention_days: Some(730),
            method: DeletionMethod::HardDelete,
            requires_approval: false,
            audit_level: AuditLevel::Minimal,
        },
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;

    #[test]
    fn test_health_data_policy() {
        let policy = policy_for(DataCategory::ProtectedHealthData);
        assert_eq!(policy.retention_days, Some(2190));
        assert_eq!(policy.method, DeletionMethod::CryptoErasure);
        assert!(policy.requires_approval);
        assert_eq!(policy.audit_level, AuditLevel::Comprehensive);
    }

    #[test]
    fn test_billing_data_is_soft_deleted_with_approval() {
        let policy = policy_for(DataCategory::BillingData);
        assert_eq!(policy.method, DeletionMethod::SoftDelete);
        assert!(policy.requires_approval);
        assert_eq!(policy.retention_days, Some(3650));
    }

    #[test]
    fn test_account_data_is_indefinite() {
        let policy = policy_for(DataCategory::AccountData);
        assert_eq!(policy.retention_days, None);
        assert!(!policy.requires_approval);
    }

    #[test]
    fn test_automatic_categories_never_use_crypto_erasure() {
        for category in [
            DataCategory::SystemLogs,
            DataCategory::AccountData,
            DataCategory::AnonymizedAnalytics,
        ] {
            let policy = policy_for(category);
            assert!(!policy.requires_approval);
            assert_ne!(policy.method, DeletionMethod::CryptoErasure);
        }
    }

    #[test]
    fn test_category_parse_rejects_unknown() {
        assert!(DataCategory::parse("protected-health-data").is_ok());
        let err = DataCategory::parse("secret-sauce").unwrap_err();
        assert!(matches!(
            err,
            shared::error::CommonError::RetentionPolicy { .. }
        ));
    }
}
