// Tenant key lifecycle: create-on-first-use, alias resolution, rotation and
// scheduled destruction. One key (plus at most one rotating predecessor)
// exists per tenant; destroying it is cryptographic erasure of everything
// wrapped under it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use shared::retry::{RetryPolicy, with_retry};
use shared::tenant::TenantId;
use tracing::{info, warn};

use super::{KeyLifecycleEvent, KeyLifecycleEventReceiver, KeyLifecycleEventSender};
use crate::logic::key_service::{CreateKeySpec, KeyServiceLike};
use crate::repository::CustomerKeyRepositoryLike;

/// Destruction window for a rotated-out predecessor key. Old ciphertext stays
/// decryptable through the old handle until the window elapses.
pub const ROTATION_DESTRUCTION_WINDOW_DAYS: i32 = 30;

/// Minimum window for explicit key destruction; there is no undo besides it.
pub const MIN_DESTRUCTION_WINDOW_DAYS: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyState {
    Active,
    Rotating,
    PendingDeletion,
    Destroyed,
}

impl KeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyState::Active => "active",
            KeyState::Rotating => "rotating",
            KeyState::PendingDeletion => "pending_deletion",
            KeyState::Destroyed => "destroyed",
        }
    }

    pub fn parse(s: &str) -> Option<KeyState> {
        match s {
            "active" => Some(KeyState::Active),
            "rotating" => Some(KeyState::Rotating),
            "pending_deletion" => Some(KeyState::PendingDeletion),
            "destroyed" => Some(KeyState::Destroyed),
            _ => None,
        }
    }

    /// Whether the key may serve new wrap/unwrap requests.
    pub fn is_usable(&self) -> bool {
        matches!(self, KeyState::Active | KeyState::Rotating)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerKey {
    pub tenant_id: TenantId,
    pub key_id: String,
    pub alias: String,
    pub state: KeyState,
    pub created_at: DateTime<Utc>,
    pub rotated_at: Option<DateTime<Utc>>,
    /// Previous key handle after a rotation, retained until its scheduled
    /// destruction so old ciphertext remains decryptable.
    pub previous_key_id: Option<String>,
}

pub struct CustomerKeyRegistry {
    key_service: Arc<dyn KeyServiceLike>,
    repo: Arc<dyn CustomerKeyRepositoryLike>,
    events: KeyLifecycleEventSender,
    retry: RetryPolicy,
    // serializes rotations per tenant without blocking decrypts
    rotation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl CustomerKeyRegistry {
    pub fn new(
        key_service: Arc<dyn KeyServiceLike>,
        repo: Arc<dyn CustomerKeyRepositoryLike>,
    ) -> Self {
        let (events, _rx) = tokio::sync::broadcast::channel(64);
        Self {
            key_service,
            repo,
            events,
            retry: RetryPolicy::default(),
            rotation_locks: DashMap::new(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn subscribe(&self) -> KeyLifecycleEventReceiver {
        self.events.subscribe()
    }

    fn publish(&self, event: KeyLifecycleEvent) {
        // subscriber-less channels are fine; events are advisory
        let _ = self.events.send(event);
    }

    fn rotation_lock(&self, tenant_id: &TenantId) -> Arc<tokio::sync::Mutex<()>> {
        self.rotation_locks
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Resolve the tenant's key, creating it on first use.
    ///
    /// Creation is idempotent under concurrency: the alias is pointed at the
    /// new key with compare-and-set semantics, and a caller that loses the
    /// race discards its orphan key and adopts the winner's.
    pub async fn get_or_create_key(&self, tenant_id: &TenantId) -> Result<CustomerKey, CommonError> {
        let alias = tenant_id.key_alias();

        if let Some(key_id) = with_retry(&self.retry, "resolve_alias", || {
            self.key_service.resolve_alias(&alias)
        })
        .await?
        {
            // key exists in the service; make sure the registry row does too
            if let Some(existing) = self.repo.get_customer_key(tenant_id).await? {
                return Ok(existing);
            }
            let record = CustomerKey {
                tenant_id: tenant_id.clone(),
                key_id,
                alias,
                state: KeyState::Active,
                created_at: Utc::now(),
                rotated_at: None,
                previous_key_id: None,
            };
            self.repo.upsert_customer_key(&record).await?;
            return Ok(record);
        }

        let spec = CreateKeySpec::for_tenant(tenant_id);
        let key_id = with_retry(&self.retry, "create_key", || {
            self.key_service.create_key(&spec)
        })
        .await?;

        match self.key_service.create_alias(&alias, &key_id).await {
            Ok(()) => {
                let record = CustomerKey {
                    tenant_id: tenant_id.clone(),
                    key_id: key_id.clone(),
                    alias,
                    state: KeyState::Active,
                    created_at: Utc::now(),
                    rotated_at: None,
                    previous_key_id: None,
                };
                self.repo.upsert_customer_key(&record).await?;
                info!(tenant_id = %tenant_id, key_id = %key_id, "created tenant key");
                self.publish(KeyLifecycleEvent::KeyCreated {
                    tenant_id: tenant_id.clone(),
                    key_id,
                });
                Ok(record)
            }
            Err(create_err) => {
                // lost the alias race: adopt the winner's key and discard ours
                let Some(winner_key_id) = self
                    .key_service
                    .resolve_alias(&alias)
                    .await?
                else {
                    return Err(create_err);
                };
                warn!(
                    tenant_id = %tenant_id,
                    orphan_key_id = %key_id,
                    "concurrent key creation detected, discarding orphan key"
                );
                if let Err(cleanup_err) = self
                    .key_service
                    .schedule_key_deletion(&key_id, MIN_DESTRUCTION_WINDOW_DAYS)
                    .await
                {
                    warn!(
                        tenant_id = %tenant_id,
                        orphan_key_id = %key_id,
                        error = %cleanup_err,
                        "failed to schedule orphan key destruction"
                    );
                }
                if let Some(existing) = self.repo.get_customer_key(tenant_id).await? {
                    return Ok(existing);
                }
                let record = CustomerKey {
                    tenant_id: tenant_id.clone(),
                    key_id: winner_key_id,
                    alias,
                    state: KeyState::Active,
                    created_at: Utc::now(),
                    rotated_at: None,
                    previous_key_id: None,
                };
                self.repo.upsert_customer_key(&record).await?;
                Ok(record)
            }
        }
    }

    /// Rotate the tenant's key: mint a new key version, re-point the alias,
    /// and schedule the predecessor for destruction after the safety window.
    /// Rotations for one tenant are serialized; in-flight decrypts of old
    /// ciphertext keep working through the retained predecessor handle.
    pub async fn rotate_key(&self, tenant_id: &TenantId) -> Result<CustomerKey, CommonError> {
        let lock = self.rotation_lock(tenant_id);
        let _guard = lock.lock().await;

        let current = self.get_or_create_key(tenant_id).await?;
        if !current.state.is_usable() {
            return Err(CommonError::key_unavailable(format!(
                "tenant key for '{tenant_id}' is {} and cannot be rotated",
                current.state.as_str()
            )));
        }

        let spec = CreateKeySpec::for_tenant(tenant_id);
        let new_key_id = with_retry(&self.retry, "create_key", || {
            self.key_service.create_key(&spec)
        })
        .await?;

        self.key_service
            .update_alias(&current.alias, &new_key_id)
            .await?;
        self.key_service
            .schedule_key_deletion(&current.key_id, ROTATION_DESTRUCTION_WINDOW_DAYS)
            .await?;

        let record = CustomerKey {
            tenant_id: tenant_id.clone(),
            key_id: new_key_id.clone(),
            alias: current.alias,
            state: KeyState::Active,
            created_at: current.created_at,
            rotated_at: Some(Utc::now()),
            previous_key_id: Some(current.key_id.clone()),
        };
        self.repo.upsert_customer_key(&record).await?;

        info!(
            tenant_id = %tenant_id,
            new_key_id = %new_key_id,
            previous_key_id = %current.key_id,
            "rotated tenant key"
        );
        self.publish(KeyLifecycleEvent::KeyRotated {
            tenant_id: tenant_id.clone(),
            new_key_id,
            previous_key_id: current.key_id,
        });
        Ok(record)
    }

    /// Schedule irreversible destruction of the tenant's key and remove its
    /// alias. Everything wrapped under the key becomes unrecoverable once the
    /// window elapses; the grace window is the only undo there is.
    pub async fn destroy_key(
        &self,
        tenant_id: &TenantId,
        grace_days: i32,
    ) -> Result<bool, CommonError> {
        let window = grace_days.max(MIN_DESTRUCTION_WINDOW_DAYS);
        let current = self
            .repo
            .get_customer_key(tenant_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: "no key registered for tenant".to_string(),
                lookup_id: tenant_id.to_string(),
                source: None,
            })?;

        // schedule first: if the key service is unreachable the caller must
        // see the failure and retry or escalate, never assume erasure
        self.key_service
            .schedule_key_deletion(&current.key_id, window)
            .await?;
        if let Some(previous_key_id) = &current.previous_key_id {
            if let Err(err) = self
                .key_service
                .schedule_key_deletion(previous_key_id, window)
                .await
            {
                // already scheduled during rotation in the common case
                warn!(
                    tenant_id = %tenant_id,
                    previous_key_id = %previous_key_id,
                    error = %err,
                    "could not schedule predecessor key destruction"
                );
            }
        }
        self.key_service.delete_alias(&current.alias).await?;
        self.repo
            .set_key_state(tenant_id, KeyState::PendingDeletion)
            .await?;

        info!(
            tenant_id = %tenant_id,
            key_id = %current.key_id,
            pending_window_days = window,
            "scheduled tenant key destruction"
        );
        self.publish(KeyLifecycleEvent::KeyDestructionScheduled {
            tenant_id: tenant_id.clone(),
            key_id: current.key_id,
            pending_window_days: window,
        });
        Ok(true)
    }

    /// Registry view of the tenant's key, for operational tooling.
    pub async fn key_metadata(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<CustomerKey>, CommonError> {
        self.repo.get_customer_key(tenant_id).await
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::logic::key_service::LocalKeyService;
    use crate::repository::InMemoryCustomerKeyRepository;

    fn registry_with_service() -> (Arc<CustomerKeyRegistry>, Arc<LocalKeyService>) {
        let service = Arc::new(LocalKeyService::new());
        let repo = Arc::new(InMemoryCustomerKeyRepository::new());
        let registry = Arc::new(
            CustomerKeyRegistry::new(service.clone(), repo).with_retry_policy(RetryPolicy::fast()),
        );
        (registry, service)
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (registry, _service) = registry_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let first = registry.get_or_create_key(&tenant).await.unwrap();
        let second = registry.get_or_create_key(&tenant).await.unwrap();
        assert_eq!(first.key_id, second.key_id);
        assert_eq!(first.state, KeyState::Active);
    }

    #[tokio::test]
    async fn test_concurrent_creation_converges_on_one_key() {
        let (registry, service) = registry_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let tenant = tenant.clone();
            handles.push(tokio::spawn(async move {
                registry.get_or_create_key(&tenant).await.unwrap().key_id
            }));
        }

        let mut key_ids = Vec::new();
        for handle in handles {
            key_ids.push(handle.await.unwrap());
        }
        key_ids.sort();
        key_ids.dedup();
        assert_eq!(key_ids.len(), 1, "all callers must observe the same key");
        assert_eq!(
            service.resolve_alias(&tenant.key_alias()).await.unwrap(),
            Some(key_ids[0].clone())
        );
    }

    #[tokio::test]
    async fn test_rotation_repoints_alias_and_retains_predecessor() {
        let (registry, service) = registry_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let original = registry.get_or_create_key(&tenant).await.unwrap();
        let rotated = registry.rotate_key(&tenant).await.unwrap();

        assert_ne!(original.key_id, rotated.key_id);
        assert_eq!(rotated.previous_key_id.as_deref(), Some(original.key_id.as_str()));
        assert!(rotated.rotated_at.is_some());
        assert_eq!(
            service.resolve_alias(&tenant.key_alias()).await.unwrap(),
            Some(rotated.key_id.clone())
        );
        // predecessor destruction waits out the safety window
        assert_eq!(
            service.pending_deletion_window(&original.key_id),
            Some(ROTATION_DESTRUCTION_WINDOW_DAYS)
        );
    }

    #[tokio::test]
    async fn test_destroy_enforces_minimum_window_and_removes_alias() {
        let (registry, service) = registry_with_service();
        let tenant = TenantId::new("acme").unwrap();

        let key = registry.get_or_create_key(&tenant).await.unwrap();
        let destroyed = registry.destroy_key(&tenant, 1).await.unwrap();
        assert!(destroyed);

        assert_eq!(
            service.pending_deletion_window(&key.key_id),
            Some(MIN_DESTRUCTION_WINDOW_DAYS)
        );
        assert_eq!(service.resolve_alias(&tenant.key_alias()).await.unwrap(), None);
        let metadata = registry.key_metadata(&tenant).await.unwrap().unwrap();
        assert_eq!(metadata.state, KeyState::PendingDeletion);
    }

    #[tokio::test]
    async fn test_destroy_unknown_tenant_fails() {
        let (registry, _service) = registry_with_service();
        let tenant = TenantId::new("ghost").unwrap();
        let result = registry.destroy_key(&tenant, 7).await;
        assert!(matches!(result, Err(CommonError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_lifecycle_events_are_published() {
        let (registry, _service) = registry_with_service();
        let tenant = TenantId::new("acme").unwrap();
        let mut events = registry.subscribe();

        registry.get_or_create_key(&tenant).await.unwrap();
        registry.rotate_key(&tenant).await.unwrap();

        assert!(matches!(
            events.recv().await.unwrap(),
            KeyLifecycleEvent::KeyCreated { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            KeyLifecycleEvent::KeyRotated { .. }
        ));
    }
}
