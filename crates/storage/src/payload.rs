//! Payload blobs kept in object storage as zstd-compressed JSON.

use std::sync::Arc;

use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::{debug, info};

use sluice_core::{Config, JobInstanceId, Payload};

use crate::backend::StorageBackend;
use crate::error::BlobError;
use crate::store::PayloadBlobStore;

const ZSTD_LEVEL: i32 = 3;

pub struct ObjectStorePayloadStore {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl ObjectStorePayloadStore {
    pub fn new(backend: &StorageBackend, prefix: &str) -> Self {
        Self {
            store: backend.store(),
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Build from the `blob_storage` and `aws` config sections.
    pub fn from_config(config: &Config) -> Result<Self, BlobError> {
        let backend = StorageBackend::from_config(&config.blob_storage, &config.aws)?;
        info!(backend = backend.name(), prefix = %config.blob_storage.prefix, "payload store ready");
        Ok(Self::new(&backend, &config.blob_storage.prefix))
    }

    fn key_for(&self, instance: &JobInstanceId) -> String {
        let file = format!("{}.json.zst", uuid::Uuid::new_v4());
        let tail = format!("{}/{}/{}", instance.job_definition_id, instance.instance_id, file);
        if self.prefix.is_empty() {
            tail
        } else {
            format!("{}/{}", self.prefix, tail)
        }
    }
}

#[async_trait]
impl PayloadBlobStore for ObjectStorePayloadStore {
    async fn download_payload(&self, reference: &str) -> Result<Option<Payload>, BlobError> {
        let path = ObjectPath::from(reference);
        let bytes = match self.store.get(&path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                debug!(reference, "payload blob not found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let json = zstd::decode_all(bytes.as_ref())?;
        let payload = serde_json::from_slice(&json)?;
        Ok(Some(payload))
    }

    async fn upload_payload(&self, instance: &JobInstanceId, payload: &Payload) -> Result<String, BlobError> {
        let json = serde_json::to_vec(payload)?;
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)?;
        let key = self.key_for(instance);
        self.store
            .put(&ObjectPath::from(key.as_str()), bytes::Bytes::from(compressed).into())
            .await?;
        debug!(job_id = %instance, reference = %key, "payload uploaded");
        Ok(key)
    }
}
