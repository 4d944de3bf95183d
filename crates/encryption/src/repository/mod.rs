mod dynamo;
mod memory;

pub use dynamo::DynamoCustomerKeyRepository;
pub use memory::InMemoryCustomerKeyRepository;

use shared::error::CommonError;
use shared::tenant::TenantId;

use crate::logic::registry::{CustomerKey, KeyState};

/// Persistence for the registry's view of tenant keys. The key material
/// itself never passes through here, only handles and lifecycle state.
#[async_trait::async_trait]
pub trait CustomerKeyRepositoryLike: Send + Sync {
    async fn upsert_customer_key(&self, key: &CustomerKey) -> Result<(), CommonError>;

    async fn get_customer_key(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<CustomerKey>, CommonError>;

    async fn set_key_state(
        &self,
        tenant_id: &TenantId,
        state: KeyState,
    ) -> Result<(), CommonError>;

    async fn list_customer_keys(&self) -> Result<Vec<CustomerKey>, CommonError>;
}
