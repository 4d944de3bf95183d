use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::CommonError;
use crate::storage::{DELETED_AT_MARKER, DELETED_MARKER, DocumentStoreLike, ObjectStoreLike};
use crate::tenant::TenantScope;

/// In-memory document store for tests.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    tables: DashMap<String, BTreeMap<String, serde_json::Value>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait::async_trait]
impl DocumentStoreLike for InMemoryDocumentStore {
    async fn put_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), CommonError> {
        self.tables
            .entry(scope.table_name())
            .or_default()
            .insert(resource_id.to_string(), document.clone());
        Ok(())
    }

    async fn get_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>, CommonError> {
        Ok(self
            .tables
            .get(&scope.table_name())
            .and_then(|table| table.get(resource_id).cloned()))
    }

    async fn list_items(
        &self,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, CommonError> {
        Ok(self
            .tables
            .get(&scope.table_name())
            .map(|table| table.values().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<(), CommonError> {
        if let Some(mut table) = self.tables.get_mut(&scope.table_name()) {
            table.remove(resource_id);
        }
        Ok(())
    }

    async fn mark_deleted(
        &self,
        scope: &TenantScope,
        resource_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), CommonError> {
        let mut table =
            self.tables
                .get_mut(&scope.table_name())
                .ok_or_else(|| CommonError::NotFound {
                    msg: format!("no table for scope {}", scope.table_name()),
                    lookup_id: resource_id.to_string(),
                    source: None,
                })?;
        let document = table
            .get_mut(resource_id)
            .ok_or_else(|| CommonError::NotFound {
                msg: "resource not found".to_string(),
                lookup_id: resource_id.to_string(),
                source: None,
            })?;
        if let Some(obj) = document.as_object_mut() {
            obj.insert(DELETED_MARKER.to_string(), serde_json::Value::Bool(true));
            obj.insert(
                DELETED_AT_MARKER.to_string(),
                serde_json::Value::String(deleted_at.to_rfc3339()),
            );
        }
        Ok(())
    }
}

/// In-memory object store for tests. Presigned URLs use a `memory://` scheme.
#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: DashMap<String, Vec<u8>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.get(key).map(|v| v.clone())
    }
}

#[async_trait::async_trait]
impl ObjectStoreLike for InMemoryObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        _expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CommonError> {
        self.objects.insert(key.to_string(), bytes);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CommonError> {
        Ok(self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CommonError> {
        let keys: Vec<String> = self.list_keys(prefix).await?;
        for key in &keys {
            self.objects.remove(key);
        }
        Ok(keys.len())
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        valid_for: Duration,
    ) -> Result<String, CommonError> {
        if !self.objects.contains_key(key) {
            return Err(CommonError::NotFound {
                msg: "object not found".to_string(),
                lookup_id: key.to_string(),
                source: None,
            });
        }
        Ok(format!(
            "memory://{key}?expires_in={}",
            valid_for.as_secs()
        ))
    }
}

#[cfg(test)]
mod unit_test {
    use super::*;
    use crate::tenant::TenantId;
    use serde_json::json;

    fn scope() -> TenantScope {
        TenantScope::new(TenantId::new("acme").unwrap(), "scans").unwrap()
    }

    #[tokio::test]
    async fn test_document_store_roundtrip() {
        let store = InMemoryDocumentStore::new();
        let scope = scope();

        store
            .put_item(&scope, "scan-1", &json!({"a": 1}))
            .await
            .unwrap();
        let item = store.get_item(&scope, "scan-1").await.unwrap().unwrap();
        assert_eq!(item["a"], 1);

        store.delete_item(&scope, "scan-1").await.unwrap();
        assert!(store.get_item(&scope, "scan-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_deleted_keeps_bytes() {
        let store = InMemoryDocumentStore::new();
        let scope = scope();

        store
            .put_item(&scope, "scan-1", &json!({"a": 1}))
            .await
            .unwrap();
        store
            .mark_deleted(&scope, "scan-1", Utc::now())
            .await
            .unwrap();

        let item = store.get_item(&scope, "scan-1").await.unwrap().unwrap();
        assert_eq!(item[DELETED_MARKER], true);
        assert_eq!(item["a"], 1);
    }

    #[tokio::test]
    async fn test_object_store_prefix_delete() {
        let store = InMemoryObjectStore::new();
        store
            .put_object("customers/acme/scans/s1/part-0", b"x".to_vec(), None)
            .await
            .unwrap();
        store
            .put_object("customers/acme/scans/s1/part-1", b"y".to_vec(), None)
            .await
            .unwrap();
        store
            .put_object("customers/other/scans/s1/part-0", b"z".to_vec(), None)
            .await
            .unwrap();

        let removed = store.delete_prefix("customers/acme/scans/s1/").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            store.list_keys("customers/other/").await.unwrap().len(),
            1
        );
    }
}
