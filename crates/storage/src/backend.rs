use std::path::{Path, PathBuf};
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use tracing::info;

use sluice_core::config::{AwsConfig, BlobStorageConfig};

use crate::error::BlobError;

/// Unified blob backend wrapping object_store.
pub enum StorageBackend {
    Local(LocalBackend),
    S3(S3Backend),
    Memory(Arc<dyn ObjectStore>),
}

impl StorageBackend {
    /// Pick the backend named by `blob.backend` ("local", "s3" or "memory").
    pub fn from_config(blob: &BlobStorageConfig, aws: &AwsConfig) -> Result<Self, BlobError> {
        match blob.backend.to_lowercase().as_str() {
            "local" => {
                std::fs::create_dir_all(&blob.data_dir)?;
                Ok(StorageBackend::Local(LocalBackend::new(&blob.data_dir)?))
            }
            "s3" => Ok(StorageBackend::S3(S3Backend::new(aws)?)),
            "memory" => Ok(StorageBackend::in_memory()),
            other => Err(BlobError::NotConfigured(format!(
                "unknown blob backend '{other}': expected local, s3 or memory"
            ))),
        }
    }

    pub fn in_memory() -> Self {
        StorageBackend::Memory(Arc::new(InMemory::new()))
    }

    /// Get an Arc-wrapped ObjectStore.
    pub fn store(&self) -> Arc<dyn ObjectStore> {
        match self {
            StorageBackend::Local(b) => b.store.clone(),
            StorageBackend::S3(b) => b.store.clone(),
            StorageBackend::Memory(store) => store.clone(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageBackend::Local(_) => "local",
            StorageBackend::S3(_) => "s3",
            StorageBackend::Memory(_) => "memory",
        }
    }
}

/// Local filesystem backend.
pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
    pub data_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(data_dir: &Path) -> Result<Self, BlobError> {
        let canonical = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| BlobError::Other(format!("local filesystem error: {e}")))?;
        info!(path = %canonical.display(), "blob storage: local backend");
        Ok(Self {
            store: Arc::new(store),
            data_dir: canonical,
        })
    }
}

/// S3 backend.
pub struct S3Backend {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
}

impl S3Backend {
    pub fn new(aws: &AwsConfig) -> Result<Self, BlobError> {
        let bucket = aws
            .s3_bucket
            .as_deref()
            .ok_or_else(|| BlobError::NotConfigured("S3_BUCKET not set".into()))?;

        let mut builder = AmazonS3Builder::new().with_region(&aws.region);

        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        builder = match aws.endpoint_url.as_deref().and_then(normalize_endpoint) {
            Some(endpoint) => builder
                .with_bucket_name(bucket)
                .with_allow_http(endpoint.starts_with("http://"))
                .with_endpoint(endpoint),
            None => builder.with_url(format!("s3://{bucket}")),
        };

        let store = builder.build()?;

        info!(bucket, region = %aws.region, "blob storage: S3 backend");

        Ok(Self {
            store: Arc::new(store),
            bucket: bucket.to_string(),
        })
    }
}

/// S3-compatible endpoints (MinIO, LocalStack) may be configured without a
/// scheme; object_store needs an absolute URL. Blank means "use AWS".
fn normalize_endpoint(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        Some(raw.trim_end_matches('/').to_string())
    } else {
        Some(format!("https://{}", raw.trim_end_matches('/')))
    }
}
