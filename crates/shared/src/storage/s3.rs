use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use chrono::{DateTime, Utc};

use crate::error::CommonError;
use crate::storage::ObjectStoreLike;

/// Object store backed by S3, one bucket shared across tenants with
/// tenant-prefixed keys.
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    pub async fn from_env(bucket: impl Into<String>, region: Option<String>) -> Self {
        let mut config = aws_config::load_from_env().await;
        if let Some(region) = region {
            config = config
                .to_builder()
                .region(aws_config::Region::new(region))
                .build();
        }
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }

    fn repo_err(msg: impl Into<String>, err: impl std::fmt::Display) -> CommonError {
        CommonError::Repository {
            msg: msg.into(),
            source: Some(anyhow::anyhow!("{err}")),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStoreLike for S3ObjectStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), CommonError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes));
        if let Some(expires_at) = expires_at {
            request = request.expires(aws_sdk_s3::primitives::DateTime::from_secs(
                expires_at.timestamp(),
            ));
        }
        request
            .send()
            .await
            .map_err(|e| Self::repo_err("failed to put object", e))?;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, CommonError> {
        let mut keys = Vec::new();
        let mut continuation_token = None;
        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.clone())
                .send()
                .await
                .map_err(|e| Self::repo_err("failed to list objects", e))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(|k| k.to_string())),
            );

            match output.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, CommonError> {
        let keys = self.list_keys(prefix).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut removed = 0usize;
        // DeleteObjects accepts at most 1000 keys per request
        for chunk in keys.chunks(1000) {
            let identifiers = chunk
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| Self::repo_err("invalid object identifier", e))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|e| Self::repo_err("invalid delete request", e))?;
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| Self::repo_err("failed to delete objects", e))?;
            removed += chunk.len();
        }
        Ok(removed)
    }

    async fn presigned_get_url(
        &self,
        key: &str,
        valid_for: Duration,
    ) -> Result<String, CommonError> {
        let config = PresigningConfig::expires_in(valid_for)
            .map_err(|e| Self::repo_err("invalid presigning expiry", e))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| Self::repo_err("failed to presign object url", e))?;
        Ok(request.uri().to_string())
    }
}
