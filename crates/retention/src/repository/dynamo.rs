use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, SecondsFormat, Utc};

use shared::error::CommonError;
use shared::tenant::TenantId;

use crate::logic::scheduler::{RetentionEntry, RetentionEntryStatus};
use crate::repository::{
    DeletionQueueItem, DeletionQueueLike, DeletionQueueStatus, RetentionLedgerLike,
};

const PAYLOAD_ATTR: &str = "payload";

/// Fixed-width UTC timestamp so lexicographic comparison in filter
/// expressions matches chronological order.
fn sortable_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn repo_err(msg: impl Into<String>, err: impl std::fmt::Display) -> CommonError {
    CommonError::Repository {
        msg: msg.into(),
        source: Some(anyhow::anyhow!("{err}")),
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    item: &std::collections::HashMap<String, AttributeValue>,
) -> Result<T, CommonError> {
    let payload = item
        .get(PAYLOAD_ATTR)
        .and_then(|v| v.as_s().ok())
        .ok_or_else(|| CommonError::Repository {
            msg: format!("stored item is missing the '{PAYLOAD_ATTR}' attribute"),
            source: None,
        })?;
    serde_json::from_str(payload).map_err(CommonError::from)
}

/// Retention ledger backed by a shared DynamoDB table keyed by retention id.
/// Tenant, status and expiry are mirrored into filterable attributes.
pub struct DynamoRetentionLedger {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoRetentionLedger {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl RetentionLedgerLike for DynamoRetentionLedger {
    async fn put_entry(&self, entry: &RetentionEntry) -> Result<(), CommonError> {
        let payload = serde_json::to_string(entry)?;
        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .item(
                "retention_id",
                AttributeValue::S(entry.retention_id.clone()),
            )
            .item("tenant_id", AttributeValue::S(entry.tenant_id.to_string()))
            .item(
                "entry_status",
                AttributeValue::S(entry.status.as_str().to_string()),
            )
            .item(PAYLOAD_ATTR, AttributeValue::S(payload));
        if let Some(expires_at) = entry.expires_at {
            request = request.item(
                "expires_at",
                AttributeValue::S(sortable_timestamp(expires_at)),
            );
        }
        request
            .send()
            .await
            .map_err(|e| repo_err("failed to put retention entry", e))?;
        Ok(())
    }

    async fn get_entry(&self, retention_id: &str) -> Result<Option<RetentionEntry>, CommonError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("retention_id", AttributeValue::S(retention_id.to_string()))
            .send()
            .await
            .map_err(|e| repo_err("failed to get retention entry", e))?;
        output.item().map(parse_payload).transpose()
    }

    async fn list_entries_for_tenant(
        &self,
        tenant_id: &TenantId,
    ) -> Result<Vec<RetentionEntry>, CommonError> {
        // a tenant GSI would avoid the scan at scale; volumes here are small
        let mut entries = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("tenant_id = :tenant_id")
                .expression_attribute_values(
                    ":tenant_id",
                    AttributeValue::S(tenant_id.to_string()),
                )
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| repo_err("failed to scan retention ledger", e))?;

            for item in output.items() {
                entries.push(parse_payload(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn list_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RetentionEntry>, CommonError> {
        let mut entries = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression(
                    "entry_status = :active AND attribute_exists(expires_at) \
                     AND expires_at <= :now",
                )
                .expression_attribute_values(
                    ":active",
                    AttributeValue::S(RetentionEntryStatus::Active.as_str().to_string()),
                )
                .expression_attribute_values(
                    ":now",
                    AttributeValue::S(sortable_timestamp(now)),
                )
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| repo_err("failed to scan for expired entries", e))?;

            for item in output.items() {
                entries.push(parse_payload(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(entries)
    }
}

/// Deletion queue backed by a shared DynamoDB table keyed by queue id.
pub struct DynamoDeletionQueue {
    client: aws_sdk_dynamodb::Client,
    table_name: String,
}

impl DynamoDeletionQueue {
    pub fn new(client: aws_sdk_dynamodb::Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }
}

#[async_trait::async_trait]
impl DeletionQueueLike for DynamoDeletionQueue {
    async fn enqueue(&self, item: &DeletionQueueItem) -> Result<(), CommonError> {
        let payload = serde_json::to_string(item)?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .item("queue_id", AttributeValue::S(item.queue_id.clone()))
            .item(
                "queue_status",
                AttributeValue::S(item.status.as_str().to_string()),
            )
            .item(PAYLOAD_ATTR, AttributeValue::S(payload))
            .send()
            .await
            .map_err(|e| repo_err("failed to enqueue deletion item", e))?;
        Ok(())
    }

    async fn get(&self, queue_id: &str) -> Result<Option<DeletionQueueItem>, CommonError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("queue_id", AttributeValue::S(queue_id.to_string()))
            .send()
            .await
            .map_err(|e| repo_err("failed to get deletion queue item", e))?;
        output.item().map(parse_payload).transpose()
    }

    async fn list_by_status(
        &self,
        status: DeletionQueueStatus,
    ) -> Result<Vec<DeletionQueueItem>, CommonError> {
        let mut items = Vec::new();
        let mut start_key = None;
        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table_name)
                .filter_expression("queue_status = :status")
                .expression_attribute_values(
                    ":status",
                    AttributeValue::S(status.as_str().to_string()),
                )
                .set_exclusive_start_key(start_key)
                .send()
                .await
                .map_err(|e| repo_err("failed to scan deletion queue", e))?;

            for item in output.items() {
                items.push(parse_payload(item)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn remove(&self, queue_id: &str) -> Result<(), CommonError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .key("queue_id", AttributeValue::S(queue_id.to_string()))
            .send()
            .await
            .map_err(|e| repo_err("failed to remove deletion queue item", e))?;
        Ok(())
    }
}
