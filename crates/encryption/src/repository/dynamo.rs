use aws_sdk_dynamodb::types::AttributeValue;

use shared::error::CommonError;
use shared::tenant::TenantId;

use crate::logic::registry::{CustomerKey, KeyState};
use crate::repository::CustomerKeyRepositoryLike;

const KEY_ATTR: &str = "tenant_id";
const PAYLOAD_ATTR: &str = "payload";
const STATE_ATTR: &str = "key_state";

/// Customer key repository backed by a shared DynamoDB table keyed by tenant
/// id. Rows carry the full record as a JSON payload plus a queryable state
/// attribute.
pub struct DynamoCustomerKeyRepository {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoCustomerKeyRepository {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    fn repo_err(msg: impl Into<String>, err: impl std::fmt::Display) -> CommonError {
        CommonError::Repository {
            msg: msg.into(),
            source: Some(anyhow::anyhow!("{err}")),
        }
    }
}

#[async_trait::async_trait]
impl CustomerKeyRepositoryLike for DynamoCustomerKeyRepository {
    async fn upsert_customer_key(&self, key: &CustomerKey) -> Result<(), CommonError> {
        let payload = serde_json::to_string(key)?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item(KEY_ATTR, AttributeValue::S(key.tenant_id.to_string()))
            .item(PAYLOAD_ATTR, AttributeValue::S(payload))
            .item(STATE_ATTR, AttributeValue::S(key.state.as_str().to_string()))
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to upsert customer key", e))?;
        Ok(())
    }

    async fn get_customer_key(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Option<CustomerKey>, CommonError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(KEY_ATTR, AttributeValue::S(tenant_id.to_string()))
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to get customer key", e))?;

        output
            .item()
            .and_then(|item| item.get(PAYLOAD_ATTR))
            .and_then(|v| v.as_s().ok())
            .map(|payload| serde_json::from_str(payload).map_err(CommonError::from))
            .transpose()
    }

    async fn set_key_state(
        &self,
        tenant_id: &TenantId,
        state: KeyState,
    ) -> Result<(), CommonError> {
        let mut key = self
            .get_customer_key(tenant_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: "no key registered for tenant".to_string(),
                lookup_id: tenant_id.to_string(),
                source: None,
            })?;
        key.state = state;
        self.upsert_customer_key(&key).await
    }

    async fn list_customer_keys(&self) -> Result<Vec<CustomerKey>, CommonError> {
        let output = self
            .client
            .scan()
            .table_name(&self.table_name)
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to scan customer keys", e))?;

        output
            .items()
            .iter()
            .filter_map(|item| item.get(PAYLOAD_ATTR).and_then(|v| v.as_s().ok()))
            .map(|payload| serde_json::from_str(payload).map_err(CommonError::from))
            .collect()
    }
}
