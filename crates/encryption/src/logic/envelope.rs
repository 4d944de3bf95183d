// Envelope encryption of whole records. A fresh data key is generated and
// wrapped by the tenant's key per operation; the record ciphertext is bound
// to the same encryption context the wrap was, and carries a content hash for
// tamper detection on the way back out.

use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::error::CommonError;
use shared::retry::{RetryPolicy, with_retry};
use shared::tenant::TenantId;

use crate::logic::key_service::{EncryptionContext, KeyServiceLike, PlaintextDek, WrappedDek};
use crate::logic::registry::CustomerKeyRegistry;

pub const ENVELOPE_ALGORITHM: &str = "AES-256-GCM";
pub const ENVELOPE_FORMAT_VERSION: &str = "1.0";

/// An envelope-encrypted record. Immutable once created: re-encryption after
/// a key rotation produces a new record that supersedes this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub tenant_id: TenantId,
    /// base64(nonce || AES-GCM ciphertext) of the canonical plaintext
    pub ciphertext: String,
    pub wrapped_dek: WrappedDek,
    /// Handle of the tenant key version that wrapped the data key.
    pub key_id: String,
    pub context: EncryptionContext,
    pub algorithm: String,
    /// SHA-256 of the canonical plaintext, hex encoded.
    pub content_hash: String,
    pub format_version: String,
    pub encrypted_at: DateTime<Utc>,
}

/// Serialize with stable field ordering so hashing and AAD binding are
/// deterministic across processes.
pub fn canonical_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, CommonError> {
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_vec(&value)?)
}

pub fn content_hash_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn aead_encrypt(
    dek: &PlaintextDek,
    plaintext: &[u8],
    context: &EncryptionContext,
) -> Result<String, CommonError> {
    if dek.0.len() != 32 {
        return Err(CommonError::key_unavailable(format!(
            "invalid data key length: expected 32 bytes for AES-256, got {}",
            dek.0.len()
        )));
    }
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&dek.0));

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = context.canonical_bytes();
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|e| CommonError::Unknown(anyhow::anyhow!("record encryption failed: {e}")))?;

    let mut combined = Vec::with_capacity(nonce_bytes.len() + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        &combined,
    ))
}

fn aead_decrypt(
    dek: &PlaintextDek,
    ciphertext: &str,
    context: &EncryptionContext,
) -> Result<Vec<u8>, CommonError> {
    if dek.0.len() != 32 {
        return Err(CommonError::key_unavailable(format!(
            "invalid data key length: expected 32 bytes for AES-256, got {}",
            dek.0.len()
        )));
    }
    let combined = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, ciphertext)
        .map_err(|e| CommonError::integrity(format!("ciphertext is not valid base64: {e}")))?;
    if combined.len() < 12 {
        return Err(CommonError::integrity(
            "ciphertext is too short to contain a nonce",
        ));
    }

    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(&dek.0));
    let nonce = Nonce::from_slice(&combined[..12]);
    let aad = context.canonical_bytes();

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: &combined[12..],
                aad: &aad,
            },
        )
        .map_err(|_| CommonError::integrity("record authentication failed during decryption"))
}

pub struct EnvelopeEngine {
    registry: Arc<CustomerKeyRegistry>,
    key_service: Arc<dyn KeyServiceLike>,
    retry: RetryPolicy,
}

impl EnvelopeEngine {
    pub fn new(
        registry: Arc<CustomerKeyRegistry>,
        key_service: Arc<dyn KeyServiceLike>,
    ) -> Self {
        Self {
            registry,
            key_service,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<CustomerKeyRegistry> {
        &self.registry
    }

    /// Envelope-encrypt `value` for `tenant_id`.
    ///
    /// Ordering matters: the record is fully assembled, content hash
    /// included, before the caller can persist anything, and the raw data key
    /// is dropped (and zeroed) before this function returns.
    pub async fn encrypt<T: Serialize>(
        &self,
        tenant_id: &TenantId,
        value: &T,
        purpose: &str,
        caller_id: &str,
    ) -> Result<EncryptedRecord, CommonError> {
        let context = EncryptionContext::new(tenant_id.clone(), purpose, caller_id);
        let key = self.registry.get_or_create_key(tenant_id).await?;
        if !key.state.is_usable() {
            return Err(CommonError::key_unavailable(format!(
                "tenant key for '{tenant_id}' is {}",
                key.state.as_str()
            )));
        }

        let data_key = with_retry(&self.retry, "generate_data_key", || {
            self.key_service.generate_data_key(&key.key_id, &context)
        })
        .await?;
        let crate::logic::key_service::GeneratedDataKey { plaintext, wrapped } = data_key;

        let canonical = canonical_json_bytes(value)?;
        let content_hash = content_hash_hex(&canonical);
        let ciphertext = aead_encrypt(&plaintext, &canonical, &context)?;
        drop(plaintext); // zeroes the raw DEK

        Ok(EncryptedRecord {
            tenant_id: tenant_id.clone(),
            ciphertext,
            wrapped_dek: wrapped,
            key_id: key.key_id,
            context,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            content_hash,
            format_version: ENVELOPE_FORMAT_VERSION.to_string(),
            encrypted_at: Utc::now(),
        })
    }

    /// Decrypt a record for `tenant_id`.
    ///
    /// The tenant check runs before any key-service traffic; the key service
    /// then independently verifies the stored context during unwrap, and the
    /// content hash is verified before anything is returned.
    pub async fn decrypt<T: DeserializeOwned>(
        &self,
        tenant_id: &TenantId,
        record: &EncryptedRecord,
        purpose: &str,
    ) -> Result<T, CommonError> {
        if record.tenant_id != *tenant_id {
            return Err(CommonError::TenantMismatch {
                caller_tenant: tenant_id.to_string(),
                record_tenant: record.tenant_id.to_string(),
            });
        }
        tracing::debug!(
            tenant_id = %tenant_id,
            purpose,
            original_purpose = %record.context.purpose,
            "decrypting record"
        );

        let dek = with_retry(&self.retry, "unwrap_data_key", || {
            self.key_service
                .unwrap_data_key(&record.key_id, &record.wrapped_dek, &record.context)
        })
        .await?;

        let plaintext = aead_decrypt(&dek, &record.ciphertext, &record.context)?;
        drop(dek);

        let actual_hash = content_hash_hex(&plaintext);
        if actual_hash != record.content_hash {
            return Err(CommonError::integrity(
                "content hash mismatch after decryption",
            ));
        }

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Re-encrypt a record under the tenant's current key after a rotation.
    /// Always a full read-decrypt-then-write-encrypt; never an in-place swap.
    pub async fn reencrypt(
        &self,
        tenant_id: &TenantId,
        record: &EncryptedRecord,
        caller_id: &str,
    ) -> Result<EncryptedRecord, CommonError> {
        let value: serde_json::Value = self
            .decrypt(tenant_id, record, &record.context.purpose)
            .await?;
        self.encrypt(tenant_id, &value, &record.context.purpose, caller_id)
            .await
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::logic::key_service::LocalKeyService;
    use crate::repository::InMemoryCustomerKeyRepository;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct ScanResult {
        scan_id: String,
        findings: Vec<String>,
        severity: u32,
    }

    fn sample_scan() -> ScanResult {
        ScanResult {
            scan_id: "scan-1".to_string(),
            findings: vec!["open-bucket".to_string(), "weak-iam".to_string()],
            severity: 7,
        }
    }

    fn engine_with_service() -> (EnvelopeEngine, Arc<LocalKeyService>) {
        let service = Arc::new(LocalKeyService::new());
        let repo = Arc::new(InMemoryCustomerKeyRepository::new());
        let registry = Arc::new(
            CustomerKeyRegistry::new(service.clone(), repo)
                .with_retry_policy(RetryPolicy::fast()),
        );
        let engine = EnvelopeEngine::new(registry, service.clone())
            .with_retry_policy(RetryPolicy::fast());
        (engine, service)
    }

    fn flip_ciphertext_bit(record: &mut EncryptedRecord) {
        let mut bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &record.ciphertext,
        )
        .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        record.ciphertext =
            base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &bytes);
    }

    #[tokio::test]
    async fn test_encrypt_decrypt_roundtrip() {
        let (engine, _service) = engine_with_service();
        let tenant = TenantId::new("acme").unwrap();
        let scan = sample_scan();

        let record = engine
            .encrypt(&tenant, &scan, "compliance-scan", "user-1")
            .await
            .unwrap();
        assert_eq!(record.algorithm, ENVELOPE_ALGORITHM);
        assert_eq!(record.format_version, ENVELOPE_FORMAT_VERSION);
        assert_eq!(record.tenant_id, tenant);

        let decrypted: ScanResult = engine
            .decrypt(&tenant, &record, "data-retrieval")
            .await
            .unwrap();
        assert_eq!(decrypted, scan);
    }

    #[tokio::test]
    async fn test_cross_tenant_decrypt_fails_before_key_service() {
        let (engine, service) = engine_with_service();
        let tenant_a = TenantId::new("acme").unwrap();
        let tenant_b = TenantId::new("globex").unwrap();

        let record = engine
            .encrypt(&tenant_a, &sample_scan(), "compliance-scan", "user-1")
            .await
            .unwrap();
        let unwraps_before = service.unwrap_call_count();

        let result: Result<ScanResult, _> =
            engine.decrypt(&tenant_b, &record, "data-retrieval").await;
        assert!(matches!(result, Err(CommonError::TenantMismatch { .. })));
        // the tenant check is a hard precondition to any key-service call
        assert_eq!(service.unwrap_call_count(), unwraps_before);
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_is_an_integrity_violation() {
        let (engine, _service) = engine_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let mut record = engine
            .encrypt(&tenant, &sample_scan(), "compliance-scan", "user-1")
            .await
            .unwrap();
        flip_ciphertext_bit(&mut record);

        let result: Result<ScanResult, _> =
            engine.decrypt(&tenant, &record, "data-retrieval").await;
        assert!(matches!(
            result,
            Err(CommonError::IntegrityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_content_hash_mismatch_is_an_integrity_violation() {
        let (engine, _service) = engine_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let mut record = engine
            .encrypt(&tenant, &sample_scan(), "compliance-scan", "user-1")
            .await
            .unwrap();
        record.content_hash = content_hash_hex(b"something else entirely");

        let result: Result<ScanResult, _> =
            engine.decrypt(&tenant, &record, "data-retrieval").await;
        assert!(matches!(
            result,
            Err(CommonError::IntegrityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_corrupted_wrapped_dek_is_an_integrity_violation() {
        let (engine, _service) = engine_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let mut record = engine
            .encrypt(&tenant, &sample_scan(), "compliance-scan", "user-1")
            .await
            .unwrap();
        record.wrapped_dek = WrappedDek(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            b"not a wrapped key at all, definitely",
        ));

        let result: Result<ScanResult, _> =
            engine.decrypt(&tenant, &record, "data-retrieval").await;
        assert!(matches!(
            result,
            Err(CommonError::IntegrityViolation { .. })
        ));
    }

    #[tokio::test]
    async fn test_old_records_survive_rotation_and_reencrypt_moves_them() {
        let (engine, _service) = engine_with_service();
        let tenant = TenantId::new("acme").unwrap();
        let scan = sample_scan();

        let record = engine
            .encrypt(&tenant, &scan, "compliance-scan", "user-1")
            .await
            .unwrap();

        engine.registry().rotate_key(&tenant).await.unwrap();

        // old ciphertext still decrypts via the retained predecessor handle
        let decrypted: ScanResult = engine
            .decrypt(&tenant, &record, "data-retrieval")
            .await
            .unwrap();
        assert_eq!(decrypted, scan);

        // re-encryption produces a new record under the current key
        let reencrypted = engine.reencrypt(&tenant, &record, "user-1").await.unwrap();
        assert_ne!(reencrypted.key_id, record.key_id);
        let roundtrip: ScanResult = engine
            .decrypt(&tenant, &reencrypted, "data-retrieval")
            .await
            .unwrap();
        assert_eq!(roundtrip, scan);
    }

    #[test]
    fn test_canonical_json_is_order_stable() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"b": 1, "a": {"d": 2, "c": 3}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"a": {"c": 3, "d": 2}, "b": 1}"#).unwrap();
        assert_eq!(
            canonical_json_bytes(&a).unwrap(),
            canonical_json_bytes(&b).unwrap()
        );
    }
}
