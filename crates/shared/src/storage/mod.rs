//! Storage abstractions for tenant-scoped data.
//!
//! Backends are chosen by constructing one of the concrete implementations
//! and injecting it where a trait object is expected: the managed-service
//! implementations for deployments, the in-memory doubles for tests. Business
//! logic never falls back between them implicitly.

mod dynamo;
mod memory;
mod s3;

pub use dynamo::DynamoDocumentStore;
pub use memory::{InMemoryDocumentStore, InMemoryObjectStore};
pub use s3::S3ObjectStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::CommonError;
use crate::tenant::TenantScope;

/// Attribute set on a stored document when it is soft-deleted in place.
pub const DELETED_MARKER: &str = "deleted";
pub const DELETED_AT_MARKER: &str = "deleted_at";

/// Key/value document storage, one logical table per tenant-scoped resource
/// type (`customer-<tenant>-<resource_type>`), keyed by resource id.
#[async_trait::async_trait]
pub trait DocumentStoreLike: Send + Sync {
    async fn put_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
        document: &serde_json::Value,
    ) -> Result<(), CommonError>;

    async fn get_item(
        &self,
        scope: &TenantScope,
        resource_id: &str,
    ) -> Result<Option<serde_json::Value>, CommonError>;

    async fn list_items(
        &self,
        scope: &TenantScope,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, CommonError>;

    /// Physically remove the stored bytes for one resource.
    async fn delete_item(&self, scope: &TenantScope, resource_id: &str)
    -> Result<(), CommonError>;

    /// Mark the resource deleted in place without removing bytes.
    async fn mark_deleted(
        &self,
        scope: &TenantScope,
        resource_id: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<(), CommonError>;
}

/// Blob storage under tenant-prefixed paths
/// (`customers/<tenant>/<resource_type>/<resource_id>/...`).
#[async_trait::async_trait]
pub trait ObjectStoreLike: Send + Sync {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CommonError>;

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CommonError>;

    /// Delete every object under `prefix`, returning how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CommonError>;

    /// Time-limited download URL for one object.
    async fn presigned_get_url(
        &self,
        key: &str,
        valid_for: Duration,
    ) -> Result<String, CommonError>;
}
