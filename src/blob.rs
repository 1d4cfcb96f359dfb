use {async_trait::async_trait, thiserror::Error, tracing::instrument};

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("No object at {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Blob fetch failed: {0}")]
    Transient(String),
}

/// Read-only access to the bucket the ingestion service spools large
/// message bodies to. Callers get exactly one attempt per envelope; the
/// queue's visibility timeout is the retry envelope.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;
}

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    BlobError::NotFound {
                        bucket: bucket.to_owned(),
                        key: key.to_owned(),
                    }
                } else {
                    BlobError::Transient(service_error.to_string())
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Transient(e.to_string()))?;
        Ok(body.into_bytes().to_vec())
    }
}
