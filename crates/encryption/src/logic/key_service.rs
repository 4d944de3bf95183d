// Key-management service abstraction. Key material for tenants never lives in
// this process: the service wraps and unwraps short-lived data keys under a
// per-tenant key it owns, and cryptographically binds every wrap/unwrap to an
// encryption context so a context mismatch fails the unwrap itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use shared::tenant::TenantId;

/// Attributes cryptographically bound to a data-key wrap. Unwrapping with a
/// different context fails independent of possessing the wrapped bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    pub tenant_id: TenantId,
    pub purpose: String,
    pub caller_id: String,
    pub timestamp: String,
}

impl EncryptionContext {
    pub fn new(tenant_id: TenantId, purpose: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            tenant_id,
            purpose: purpose.into(),
            caller_id: caller_id.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn as_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("tenant_id".to_string(), self.tenant_id.to_string()),
            ("purpose".to_string(), self.purpose.clone()),
            ("caller_id".to_string(), self.caller_id.clone()),
            ("timestamp".to_string(), self.timestamp.clone()),
        ])
    }

    /// Deterministic byte form, used as associated data in local wraps.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let sorted: BTreeMap<String, String> = self.as_map().into_iter().collect();
        serde_json::to_vec(&sorted).expect("context map serialization cannot fail")
    }
}

/// A wrapped (encrypted) data key, safe to persist alongside ciphertext.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WrappedDek(pub String);

/// Plaintext data-key material. Zeroed on drop; never persisted or logged.
#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct PlaintextDek(pub Vec<u8>);

impl std::fmt::Debug for PlaintextDek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PlaintextDek(************)")
    }
}

pub struct GeneratedDataKey {
    pub plaintext: PlaintextDek,
    pub wrapped: WrappedDek,
}

pub struct CreateKeySpec {
    pub tenant_id: TenantId,
    pub description: String,
    pub tags: Vec<(String, String)>,
}

impl CreateKeySpec {
    /// Standard spec for a tenant data key: classification and retention tags
    /// plus a resource policy restricting use to this tenant's context.
    pub fn for_tenant(tenant_id: &TenantId) -> Self {
        Self {
            tenant_id: tenant_id.clone(),
            description: format!("Tenant data encryption key for {tenant_id}"),
            tags: vec![
                ("tenant_id".to_string(), tenant_id.to_string()),
                ("purpose".to_string(), "tenant-data-encryption".to_string()),
                (
                    "data_classification".to_string(),
                    "protected-health-data".to_string(),
                ),
                ("retention".to_string(), "2190d".to_string()),
            ],
        }
    }
}

#[async_trait::async_trait]
pub trait KeyServiceLike: Send + Sync {
    /// Resolve an alias to the key id it currently points at.
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, CommonError>;

    async fn create_key(&self, spec: &CreateKeySpec) -> Result<String, CommonError>;

    /// Point a new alias at a key. Fails with `InvalidRequest` if the alias
    /// already exists, which gives callers compare-and-set semantics.
    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<(), CommonError>;

    async fn update_alias(&self, alias: &str, key_id: &str) -> Result<(), CommonError>;

    async fn delete_alias(&self, alias: &str) -> Result<(), CommonError>;

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, CommonError>;

    async fn unwrap_data_key(
        &self,
        key_id: &str,
        wrapped: &WrappedDek,
        context: &EncryptionContext,
    ) -> Result<PlaintextDek, CommonError>;

    /// Schedule irreversible destruction after `pending_window_days`.
    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        pending_window_days: i32,
    ) -> Result<(), CommonError>;
}

/// Resource policy for a tenant key: account administration stays open, but
/// cryptographic use requires the request's encryption context to declare the
/// owning tenant.
fn tenant_key_policy(tenant_id: &TenantId, account_id: &str) -> String {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Sid": "EnableAccountadministration",
                "Effect": "Allow",
                "Principal": { "AWS": format!("arn:aws:iam::{account_id}:root") },
                "Action": "kms:*",
                "Resource": "*"
            },
            {
                "Sid": "RequireTenantContextForUse",
                "Effect": "Allow",
                "Principal": { "AWS": format!("arn:aws:iam::{account_id}:root") },
                "Action": [
                    "kms:Encrypt",
                    "kms:Decrypt",
                    "kms:GenerateDataKey*",
                    "kms:DescribeKey"
                ],
                "Resource": "*",
                "Condition": {
                    "StringEquals": {
                        "kms:EncryptionContext:tenant_id": tenant_id.to_string()
                    }
                }
            }
        ]
    })
    .to_string()
}

/// AWS KMS-backed key service.
pub struct AwsKmsKeyService {
    client: aws_sdk_kms::Client,
    account_id: String,
}

impl AwsKmsKeyService {
    pub fn new(client: aws_sdk_kms::Client, account_id: impl Into<String>) -> Self {
        Self {
            client,
            account_id: account_id.into(),
        }
    }

    pub async fn from_env(region: Option<String>, account_id: impl Into<String>) -> Self {
        let mut config = aws_config::load_from_env().await;
        if let Some(region) = region {
            config = config
                .to_builder()
                .region(aws_config::Region::new(region))
                .build();
        }
        Self::new(aws_sdk_kms::Client::new(&config), account_id)
    }

    fn unavailable(msg: impl Into<String>, err: impl std::fmt::Display) -> CommonError {
        CommonError::KeyUnavailable {
            msg: msg.into(),
            source: Some(anyhow::anyhow!("{err}")),
        }
    }
}

#[async_trait::async_trait]
impl KeyServiceLike for AwsKmsKeyService {
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, CommonError> {
        match self.client.describe_key().key_id(alias).send().await {
            Ok(output) => {
                let metadata = output.key_metadata().ok_or_else(|| {
                    CommonError::key_unavailable("DescribeKey response did not contain metadata")
                })?;
                Ok(Some(metadata.key_id().to_string()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found_exception() {
                    Ok(None)
                } else {
                    Err(Self::unavailable("failed to resolve key alias", service_err))
                }
            }
        }
    }

    async fn create_key(&self, spec: &CreateKeySpec) -> Result<String, CommonError> {
        let mut request = self
            .client
            .create_key()
            .description(&spec.description)
            .key_usage(aws_sdk_kms::types::KeyUsageType::EncryptDecrypt)
            .key_spec(aws_sdk_kms::types::KeySpec::SymmetricDefault)
            .policy(tenant_key_policy(&spec.tenant_id, &self.account_id));
        for (key, value) in &spec.tags {
            let tag = aws_sdk_kms::types::Tag::builder()
                .tag_key(key)
                .tag_value(value)
                .build()
                .map_err(|e| CommonError::InvalidRequest {
                    msg: "invalid key tag".to_string(),
                    source: Some(anyhow::anyhow!("{e}")),
                })?;
            request = request.tags(tag);
        }

        let output = request
            .send()
            .await
            .map_err(|e| Self::unavailable("failed to create tenant key", e))?;
        let metadata = output.key_metadata().ok_or_else(|| {
            CommonError::key_unavailable("CreateKey response did not contain metadata")
        })?;
        Ok(metadata.key_id().to_string())
    }

    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<(), CommonError> {
        match self
            .client
            .create_alias()
            .alias_name(alias)
            .target_key_id(key_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_already_exists_exception() {
                    Err(CommonError::InvalidRequest {
                        msg: format!("alias '{alias}' already exists"),
                        source: None,
                    })
                } else {
                    Err(Self::unavailable("failed to create key alias", service_err))
                }
            }
        }
    }

    async fn update_alias(&self, alias: &str, key_id: &str) -> Result<(), CommonError> {
        self.client
            .update_alias()
            .alias_name(alias)
            .target_key_id(key_id)
            .send()
            .await
            .map_err(|e| Self::unavailable("failed to update key alias", e))?;
        Ok(())
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), CommonError> {
        self.client
            .delete_alias()
            .alias_name(alias)
            .send()
            .await
            .map_err(|e| Self::unavailable("failed to delete key alias", e))?;
        Ok(())
    }

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, CommonError> {
        let output = self
            .client
            .generate_data_key()
            .key_id(key_id)
            .key_spec(aws_sdk_kms::types::DataKeySpec::Aes256)
            .set_encryption_context(Some(context.as_map()))
            .send()
            .await
            .map_err(|e| Self::unavailable("failed to generate data key", e))?;

        let plaintext = output.plaintext().ok_or_else(|| {
            CommonError::key_unavailable("GenerateDataKey response did not contain plaintext")
        })?;
        let ciphertext_blob = output.ciphertext_blob().ok_or_else(|| {
            CommonError::key_unavailable("GenerateDataKey response did not contain ciphertext blob")
        })?;

        Ok(GeneratedDataKey {
            plaintext: PlaintextDek(plaintext.as_ref().to_vec()),
            wrapped: WrappedDek(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                ciphertext_blob.as_ref(),
            )),
        })
    }

    async fn unwrap_data_key(
        &self,
        key_id: &str,
        wrapped: &WrappedDek,
        context: &EncryptionContext,
    ) -> Result<PlaintextDek, CommonError> {
        let ciphertext_blob =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &wrapped.0)
                .map_err(|e| CommonError::integrity(format!("wrapped data key is not valid base64: {e}")))?;

        match self
            .client
            .decrypt()
            .key_id(key_id)
            .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(ciphertext_blob))
            .set_encryption_context(Some(context.as_map()))
            .send()
            .await
        {
            Ok(output) => {
                let plaintext = output.plaintext().ok_or_else(|| {
                    CommonError::key_unavailable("Decrypt response did not contain plaintext")
                })?;
                Ok(PlaintextDek(plaintext.as_ref().to_vec()))
            }
            Err(err) => {
                let service_err = err.into_service_error();
                // Context mismatches and corrupted blobs are tamper signals,
                // not transient outages; they must never be retried.
                if service_err.is_invalid_ciphertext_exception() {
                    Err(CommonError::integrity(
                        "data key unwrap rejected: ciphertext or encryption context mismatch",
                    ))
                } else {
                    Err(Self::unavailable("failed to unwrap data key", service_err))
                }
            }
        }
    }

    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        pending_window_days: i32,
    ) -> Result<(), CommonError> {
        self.client
            .schedule_key_deletion()
            .key_id(key_id)
            .pending_window_in_days(pending_window_days)
            .send()
            .await
            .map_err(|e| Self::unavailable("failed to schedule key deletion", e))?;
        Ok(())
    }
}

/// In-process key service for tests and local development. Keys are 32-byte
/// KEKs held in memory; data keys are wrapped with AES-256-GCM using the
/// canonical encryption context as associated data, which reproduces the
/// context-mismatch-fails-unwrap behavior of the managed service.
#[derive(Default)]
pub struct LocalKeyService {
    keys: DashMap<String, Vec<u8>>,
    aliases: DashMap<String, String>,
    pending_deletion: DashMap<String, i32>,
    generate_calls: AtomicUsize,
    unwrap_calls: AtomicUsize,
}

impl LocalKeyService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of generate-data-key calls served, for call-count assertions.
    pub fn generate_call_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn unwrap_call_count(&self) -> usize {
        self.unwrap_calls.load(Ordering::SeqCst)
    }

    pub fn pending_deletion_window(&self, key_id: &str) -> Option<i32> {
        self.pending_deletion.get(key_id).map(|days| *days)
    }

    /// Simulate the deletion window elapsing: the key material is destroyed
    /// and everything wrapped under it becomes permanently unrecoverable.
    pub fn complete_deletion(&self, key_id: &str) {
        self.pending_deletion.remove(key_id);
        self.keys.remove(key_id);
    }

    fn kek(&self, key_id: &str) -> Result<Vec<u8>, CommonError> {
        self.keys
            .get(key_id)
            .map(|k| k.clone())
            .ok_or_else(|| CommonError::key_unavailable(format!("key '{key_id}' does not exist or was destroyed")))
    }
}

#[async_trait::async_trait]
impl KeyServiceLike for LocalKeyService {
    async fn resolve_alias(&self, alias: &str) -> Result<Option<String>, CommonError> {
        Ok(self.aliases.get(alias).map(|id| id.clone()))
    }

    async fn create_key(&self, _spec: &CreateKeySpec) -> Result<String, CommonError> {
        let key_id = format!("local-{}", uuid::Uuid::new_v4());
        let mut kek = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut kek);
        self.keys.insert(key_id.clone(), kek);
        Ok(key_id)
    }

    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<(), CommonError> {
        match self.aliases.entry(alias.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CommonError::InvalidRequest {
                msg: format!("alias '{alias}' already exists"),
                source: None,
            }),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(key_id.to_string());
                Ok(())
            }
        }
    }

    async fn update_alias(&self, alias: &str, key_id: &str) -> Result<(), CommonError> {
        self.aliases.insert(alias.to_string(), key_id.to_string());
        Ok(())
    }

    async fn delete_alias(&self, alias: &str) -> Result<(), CommonError> {
        self.aliases.remove(alias);
        Ok(())
    }

    async fn generate_data_key(
        &self,
        key_id: &str,
        context: &EncryptionContext,
    ) -> Result<GeneratedDataKey, CommonError> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let kek = self.kek(key_id)?;

        let mut dek = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut dek);

        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&kek));
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let aad = context.canonical_bytes();
        let ciphertext = cipher
            .encrypt(
                nonce,
                Payload {
                    msg: &dek,
                    aad: &aad,
                },
            )
            .map_err(|e| CommonError::key_unavailable(format!("local data key wrap failed: {e}")))?;

        let mut combined = Vec::with_capacity(12 + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(GeneratedDataKey {
            plaintext: PlaintextDek(dek),
            wrapped: WrappedDek(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                &combined,
            )),
        })
    }

    async fn unwrap_data_key(
        &self,
        key_id: &str,
        wrapped: &WrappedDek,
        context: &EncryptionContext,
    ) -> Result<PlaintextDek, CommonError> {
        self.unwrap_calls.fetch_add(1, Ordering::SeqCst);
        let kek = self.kek(key_id)?;

        let combined =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &wrapped.0)
                .map_err(|e| CommonError::integrity(format!("wrapped data key is not valid base64: {e}")))?;
        if combined.len() < 12 {
            return Err(CommonError::integrity(
                "wrapped data key is too short to contain a nonce",
            ));
        }

        let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&kek));
        let nonce = Nonce::from_slice(&combined[..12]);
        let aad = context.canonical_bytes();

        let dek = cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &combined[12..],
                    aad: &aad,
                },
            )
            .map_err(|_| {
                CommonError::integrity(
                    "data key unwrap rejected: ciphertext or encryption context mismatch",
                )
            })?;
        Ok(PlaintextDek(dek))
    }

    async fn schedule_key_deletion(
        &self,
        key_id: &str,
        pending_window_days: i32,
    ) -> Result<(), CommonError> {
        if !self.keys.contains_key(key_id) {
            return Err(CommonError::key_unavailable(format!(
                "key '{key_id}' does not exist"
            )));
        }
        self.pending_deletion
            .insert(key_id.to_string(), pending_window_days);
        Ok(())
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;

    fn context(tenant: &str) -> EncryptionContext {
        EncryptionContext::new(
            TenantId::new(tenant).unwrap(),
            "data-protection",
            "user-1",
        )
    }

    #[tokio::test]
    async fn test_local_wrap_unwrap_roundtrip() {
        let service = LocalKeyService::new();
        let tenant = TenantId::new("acme").unwrap();
        let key_id = service
            .create_key(&CreateKeySpec::for_tenant(&tenant))
            .await
            .unwrap();

        let ctx = context("acme");
        let generated = service.generate_data_key(&key_id, &ctx).await.unwrap();
        assert_eq!(generated.plaintext.0.len(), 32);

        let unwrapped = service
            .unwrap_data_key(&key_id, &generated.wrapped, &ctx)
            .await
            .unwrap();
        assert_eq!(unwrapped.0, generated.plaintext.0);
    }

    #[tokio::test]
    async fn test_context_mismatch_fails_unwrap() {
        let service = LocalKeyService::new();
        let tenant = TenantId::new("acme").unwrap();
        let key_id = service
            .create_key(&CreateKeySpec::for_tenant(&tenant))
            .await
            .unwrap();

        let ctx = context("acme");
        let generated = service.generate_data_key(&key_id, &ctx).await.unwrap();

        let mut other = ctx.clone();
        other.purpose = "something-else".to_string();
        let result = service
            .unwrap_data_key(&key_id, &generated.wrapped, &other)
            .await;
        assert!(matches!(
            result,
            Err(CommonError::IntegrityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_alias_create_is_compare_and_set() {
        let service = LocalKeyService::new();
        let tenant = TenantId::new("acme").unwrap();
        let key_a = service
            .create_key(&CreateKeySpec::for_tenant(&tenant))
            .await
            .unwrap();
        let key_b = service
            .create_key(&CreateKeySpec::for_tenant(&tenant))
            .await
            .unwrap();

        service.create_alias("alias/t", &key_a).await.unwrap();
        let second = service.create_alias("alias/t", &key_b).await;
        assert!(matches!(second, Err(CommonError::InvalidRequest { .. })));
        assert_eq!(
            service.resolve_alias("alias/t").await.unwrap(),
            Some(key_a)
        );
    }

    #[tokio::test]
    async fn test_destroyed_key_is_unusable() {
        let service = LocalKeyService::new();
        let tenant = TenantId::new("acme").unwrap();
        let key_id = service
            .create_key(&CreateKeySpec::for_tenant(&tenant))
            .await
            .unwrap();
        let ctx = context("acme");
        let generated = service.generate_data_key(&key_id, &ctx).await.unwrap();

        service.schedule_key_deletion(&key_id, 7).await.unwrap();
        assert_eq!(service.pending_deletion_window(&key_id), Some(7));
        // still usable until the window elapses
        service
            .unwrap_data_key(&key_id, &generated.wrapped, &ctx)
            .await
            .unwrap();

        service.complete_deletion(&key_id);
        let result = service
            .unwrap_data_key(&key_id, &generated.wrapped, &ctx)
            .await;
        assert!(matches!(result, Err(CommonError::KeyUnavailable { .. })));
    }

    #[test]
    fn test_tenant_key_policy_pins_tenant_context() {
        let tenant = TenantId::new("acme").unwrap();
        let policy = tenant_key_policy(&tenant, "123456789012");
        let parsed: serde_json::Value = serde_json::from_str(&policy).unwrap();
        assert_eq!(
            parsed["Statement"][1]["Condition"]["StringEquals"]["kms:EncryptionContext:tenant_id"],
            "acme"
        );
    }
}
