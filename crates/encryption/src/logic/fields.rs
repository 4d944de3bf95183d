// Field-level encryption: individual named fields are envelope-encrypted in
// place, leaving a searchable keyed hash beside the ciphertext so equality
// lookups keep working without plaintext.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared::error::CommonError;
use shared::tenant::TenantId;
use tracing::warn;

use crate::logic::envelope::{EncryptedRecord, EnvelopeEngine};

pub const ENCRYPTED_FIELD_SUFFIX: &str = "_encrypted";
pub const FIELD_HASH_SUFFIX: &str = "_hash";

/// Keyed, truncated search hash for encrypted field values.
///
/// Equality lookups only; the truncation length trades index size against
/// collision rate and is deliberately injectable rather than hard-coded so it
/// can be revisited under security review.
pub struct FieldHasher {
    key: Vec<u8>,
    length: usize,
}

impl FieldHasher {
    pub const DEFAULT_LENGTH: usize = 16;

    pub fn new(key: Vec<u8>, length: usize) -> Result<Self, CommonError> {
        if key.is_empty() {
            return Err(CommonError::InvalidRequest {
                msg: "field hash key must not be empty".to_string(),
                source: None,
            });
        }
        if !(8..=64).contains(&length) {
            return Err(CommonError::InvalidRequest {
                msg: format!("field hash length must be 8..=64 hex chars, got {length}"),
                source: None,
            });
        }
        Ok(Self { key, length })
    }

    pub fn with_default_length(key: Vec<u8>) -> Result<Self, CommonError> {
        Self::new(key, Self::DEFAULT_LENGTH)
    }

    /// Hash a field value, scoped to the tenant so equal values in different
    /// tenants do not produce equal hashes.
    pub fn hash(&self, tenant_id: &TenantId, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update([0x1f]);
        hasher.update(tenant_id.as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
        let digest = hasher.finalize();
        digest
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect::<String>()[..self.length]
            .to_string()
    }
}

/// Wrapper serialized as the plaintext of a field envelope, so non-string
/// field values survive the roundtrip unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FieldEnvelope {
    value: serde_json::Value,
}

pub struct FieldEncryptionLayer {
    engine: Arc<EnvelopeEngine>,
    hasher: FieldHasher,
}

impl FieldEncryptionLayer {
    pub fn new(engine: Arc<EnvelopeEngine>, hasher: FieldHasher) -> Self {
        Self { engine, hasher }
    }

    /// Encrypt the declared sensitive fields of `record` in place.
    ///
    /// For each field that is present and non-null, the plaintext key is
    /// replaced by `<name>_encrypted` and `<name>_hash`. Absent or null
    /// fields are left alone.
    pub async fn encrypt_fields(
        &self,
        tenant_id: &TenantId,
        mut record: serde_json::Value,
        field_names: &[&str],
        caller_id: &str,
    ) -> Result<serde_json::Value, CommonError> {
        let obj = record.as_object_mut().ok_or_else(|| CommonError::InvalidRequest {
            msg: "field encryption requires a JSON object".to_string(),
            source: None,
        })?;

        for name in field_names {
            let Some(value) = obj.get(*name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let value = value.clone();

            let hash_input = match &value {
                serde_json::Value::String(s) => s.clone(),
                other => serde_json::to_string(other)?,
            };

            let encrypted = self
                .engine
                .encrypt(
                    tenant_id,
                    &FieldEnvelope { value },
                    &format!("field:{name}"),
                    caller_id,
                )
                .await?;

            obj.insert(
                format!("{name}{ENCRYPTED_FIELD_SUFFIX}"),
                serde_json::to_value(&encrypted)?,
            );
            obj.insert(
                format!("{name}{FIELD_HASH_SUFFIX}"),
                serde_json::Value::String(self.hasher.hash(tenant_id, &hash_input)),
            );
            obj.remove(*name);
        }
        Ok(record)
    }

    /// Decrypt every `*_encrypted` field found in `record`.
    ///
    /// A single field failing to decrypt is logged and left in its encrypted
    /// form; the rest of the record still comes back readable.
    pub async fn decrypt_fields(
        &self,
        tenant_id: &TenantId,
        mut record: serde_json::Value,
    ) -> Result<serde_json::Value, CommonError> {
        let obj = record.as_object_mut().ok_or_else(|| CommonError::InvalidRequest {
            msg: "field decryption requires a JSON object".to_string(),
            source: None,
        })?;

        let encrypted_names: Vec<String> = obj
            .keys()
            .filter_map(|key| {
                key.strip_suffix(ENCRYPTED_FIELD_SUFFIX)
                    .map(|name| name.to_string())
            })
            .collect();

        for name in encrypted_names {
            let encrypted_key = format!("{name}{ENCRYPTED_FIELD_SUFFIX}");
            let Some(encrypted_value) = obj.get(&encrypted_key) else {
                continue;
            };

            let decrypted = async {
                let record: EncryptedRecord =
                    serde_json::from_value(encrypted_value.clone())?;
                self.engine
                    .decrypt::<FieldEnvelope>(tenant_id, &record, &format!("field:{name}"))
                    .await
            }
            .await;

            match decrypted {
                Ok(envelope) => {
                    obj.insert(name.clone(), envelope.value);
                    obj.remove(&encrypted_key);
                    obj.remove(&format!("{name}{FIELD_HASH_SUFFIX}"));
                }
                Err(err) => {
                    warn!(
                        tenant_id = %tenant_id,
                        field = %name,
                        error = %err,
                        "field decryption failed, leaving field encrypted"
                    );
                }
            }
        }
        Ok(record)
    }
}
