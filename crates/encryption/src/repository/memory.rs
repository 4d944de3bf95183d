use dashmap::DashMap;
use shared::error::CommonError;
use shared::tenant::TenantId;

use crate::logic::registry::{CustomerKey, KeyState};
use crate::repository::CustomerKeyRepositoryLike;

/// In-memory customer key repository for tests.
#[derive(Default)]
pub struct InMemoryCustomerKeyRepository {
    keys: DashMap<String, CustomerKey>,
}

impl InMemoryCustomerKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CustomerKeyRepositoryLike for InMemoryCustomerKeyRepository {
    async fn upsert_customer_key(&self, key: &CustomerKey) -> Result<(), CommonError> {
        self.keys.insert(key.tenant_id.to_string(), key.clone());
        Ok(())
    }

    async fn get_customer_key(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<CustomerKey>, CommonError> {
        Ok(self.keys.get(tenant_id.as_str()).map(|k| k.clone()))
    }

    async fn set_key_state(
        &self,
        tenant_id: &TenantId,
        state: KeyState,
    ) -> Result<(), CommonError> {
        let mut entry =
            self.keys
                .get_mut(tenant_id.as_str())
                .ok_or_else(|| CommonError::NotFound {
                    msg: "no key registered for tenant".to_string(),
                    lookup_id: tenant_id.to_string(),
                    source: None,
                })?;
        entry.state = state;
        Ok(())
    }

    async fn list_customer_keys(&self) -> Result<Vec<CustomerKey>, CommonError> {
        Ok(self.keys.iter().map(|entry| entry.value().clone()).collect())
    }
}
