//! Object storage used by the thumbnail pipeline.
//!
//! The pipeline only needs two operations, reading the original and writing
//! a thumbnail, so storage is a small trait with an S3 implementation.

use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to get object {bucket}/{key}: {message}")]
    Get {
        bucket: String,
        key: String,
        message: String,
    },

    #[error("Failed to put object {bucket}/{key}: {message}")]
    Put {
        bucket: String,
        key: String,
        message: String,
    },
}

/// An object read from the store
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub body: Bytes,
    /// Content type declared on the object, if any
    pub content_type: Option<String>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError>;
}

/// BlobStore backed by S3
#[derive(Clone)]
pub struct S3BlobStore {
    client: S3Client,
}

impl S3BlobStore {
    pub fn new(client: S3Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StoreError> {
        debug!(bucket = %bucket, key = %key, "Loading object from S3");

        let get_err = |message: String| StoreError::Get {
            bucket: bucket.to_string(),
            key: key.to_string(),
            message,
        };

        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| get_err(format!("{}", e)))?;

        let content_type = response.content_type().map(|s| s.to_string());

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| get_err(format!("failed to read body: {}", e)))?
            .into_bytes();

        debug!(
            bucket = %bucket,
            key = %key,
            size = body.len(),
            content_type = ?content_type,
            "Successfully loaded object from S3"
        );

        Ok(StoredObject { body, content_type })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StoreError> {
        let size = body.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StoreError::Put {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: format!("{}", e),
            })?;

        debug!(
            bucket = %bucket,
            key = %key,
            size = size,
            content_type = %content_type,
            "Successfully wrote object to S3"
        );

        Ok(())
    }
}
