use aws_sdk_dynamodb::types::AttributeValue;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::error::CommonError;
use crate::storage::{DELETED_AT_MARKER, DELETED_MARKER, DocumentStoreLike};
use crate::tenant::TenantScope;

const KEY_ATTR: &str = "resource_id";
const PAYLOAD_ATTR: &str = "payload";

/// Document store backed by DynamoDB. Documents are stored as a JSON payload
/// attribute keyed by resource id; the soft-delete markers live as separate
/// item attributes so they survive payload rewrites.
pub struct DynamoDocumentStore {
    client: aws_sdk_dynamodb::Client,
}

impl DynamoDocumentStore {
    pub fn new(client: aws_sdk_dynamodb::Client) -> Self {
        Self { client }
    }

    pub async fn from_env(region: Option<String>) -> Self {
        let mut config = aws_config::load_from_env().await;
        if let Some(region) = region {
            config = config
                .to_builder()
                .region(aws_config::Region::new(region))
                .build();
        }
        Self::new(aws_sdk_dynamodb::Client::new(&config))
    }

    fn repo_err(msg: impl Into<String>, err: impl std::fmt::Display) -> CommonError {
        CommonError::Repository {
            msg: msg.into(),
            source: Some(anyhow::anyhow!("{err}")),
        }
    }

    fn parse_item(
        item: &HashMap<String, AttributeValue>,
    ) -> Result<serde_json::Value, CommonError> {
        let payload = item
            .get(PAYLOAD_ATTR)
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| CommonError::Repository {
                msg: format!("stored item is missing the '{PAYLOAD_ATTR}' attribute"),
                source: None,
            })?;
        let mut document: serde_json::Value = serde_json::from_str(payload)?;

        let deleted = item
            .get(DELETED_MARKER)
            .and_then(|v| v.as_bool().ok())
            .copied()
            .unwrap_or(false);
        if deleted && let Some(obj) = document.as_object_mut() {
            obj.insert(DELETED_MARKER.to_string(), serde_json::Value::Bool(true));
            if let Some(deleted_at) = item.get(DELETED_AT_MARKER).and_then(|v| v.as_s().ok()) {
                obj.insert(
                    DELETED_AT_MARKER.to_string(),
                    serde_json::Value::String(deleted_at.clone()),
                );
            }
        }
        Ok(document)
    }
}

#[async_trait::async_trait]
impl DocumentStoreLike for DynamoDocumentStore {
    async fn put_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), CommonError> {
        let payload = serde_json::to_string(document)?;
        self.client
            .put_item()
            .table_name(scope.table_name())
            .item(KEY_ATTR, AttributeValue::S(resource_id.to_string()))
            .item(PAYLOAD_ATTR, AttributeValue::S(payload))
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to put document item", e))?;
        Ok(())
    }

    async fn get_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>, CommonError> {
        let result = self
            .client
            .get_item()
            .table_name(scope.table_name())
            .key(KEY_ATTR, AttributeValue::S(resource_id.to_string()))
            .send()
            .await;

        match result {
            Ok(output) => output.item().map(Self::parse_item).transpose(),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    // missing table reads as missing item
                    Ok(None)
                } else {
                    Err(Self::repo_err("failed to get document item", service_err))
                }
            }
        }
    }

    async fn list_items(
        &self,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, CommonError> {
        let result = self
            .client
            .scan()
            .table_name(scope.table_name())
            .limit(limit as i32)
            .send()
            .await;

        match result {
            Ok(output) => output
                .items()
                .iter()
                .map(Self::parse_item)
                .collect::<Result<Vec<_>, _>>(),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_resource_not_found_exception() {
                    Ok(Vec::new())
                } else {
                    Err(Self::repo_err("failed to scan document table", service_err))
                }
            }
        }
    }

    async fn delete_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<(), CommonError> {
        self.client
            .delete_item()
            .table_name(scope.table_name())
            .key(KEY_ATTR, AttributeValue::S(resource_id.to_string()))
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to delete document item", e))?;
        Ok(())
    }

    async fn mark_deleted(
        &self,
        scope: &TenantScope,
        resource_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), CommonError> {
        self.client
            .update_item()
            .table_name(scope.table_name())
            .key(KEY_ATTR, AttributeValue::S(resource_id.to_string()))
            .update_expression("SET #deleted = :deleted, #deleted_at = :deleted_at")
            .expression_attribute_names("#deleted", DELETED_MARKER)
            .expression_attribute_names("#deleted_at", DELETED_AT_MARKER)
            .expression_attribute_values(":deleted", AttributeValue::Bool(true))
            .expression_attribute_values(
                ":deleted_at",
                AttributeValue::S(deleted_at.to_rfc3339()),
            )
            .condition_expression("attribute_exists(#key)")
            .expression_attribute_names("#key", KEY_ATTR)
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to mark document item deleted", e))?;
        Ok(())
    }
}
