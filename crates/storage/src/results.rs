//! Ingestion result files written by agents, read back record by record.
//!
//! A file holds either a JSON array of records or an object with a
//! `records` array. Keys ending in `.zst` are zstd-compressed.

use std::sync::Arc;

use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tracing::debug;

use crate::backend::StorageBackend;
use crate::error::BlobError;

pub struct ResultFileStore {
    store: Arc<dyn ObjectStore>,
}

impl ResultFileStore {
    pub fn new(backend: &StorageBackend) -> Self {
        Self { store: backend.store() }
    }

    /// All records of the file at `location`.
    pub async fn read_records(&self, location: &str) -> Result<Vec<serde_json::Value>, BlobError> {
        let bytes = self.store.get(&ObjectPath::from(location)).await?.bytes().await?;
        let json = if location.ends_with(".zst") {
            zstd::decode_all(bytes.as_ref())?
        } else {
            bytes.to_vec()
        };
        let records = match serde_json::from_slice(&json)? {
            serde_json::Value::Array(records) => records,
            serde_json::Value::Object(mut body) => match body.remove("records") {
                Some(serde_json::Value::Array(records)) => records,
                _ => return Err(BlobError::Other(format!("{location}: no records array"))),
            },
            _ => return Err(BlobError::Other(format!("{location}: not a record list"))),
        };
        debug!(location, count = records.len(), "result file read");
        Ok(records)
    }

    pub async fn write_records(&self, location: &str, records: &[serde_json::Value]) -> Result<(), BlobError> {
        let mut json = serde_json::to_vec(records)?;
        if location.ends_with(".zst") {
            json = zstd::encode_all(json.as_slice(), 3)?;
        }
        self.store
            .put(&ObjectPath::from(location), bytes::Bytes::from(json).into())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn reads_plain_and_compressed_files() {
        let files = ResultFileStore::new(&StorageBackend::in_memory());
        let records = vec![json!({"key": "A-1"}), json!({"key": "A-2"})];
        files.write_records("results/j1/issues.json", &records).await.unwrap();
        files.write_records("results/j1/issues.json.zst", &records).await.unwrap();

        assert_eq!(files.read_records("results/j1/issues.json").await.unwrap(), records);
        assert_eq!(files.read_records("results/j1/issues.json.zst").await.unwrap(), records);
    }

    #[tokio::test]
    async fn accepts_records_envelope() {
        let backend = StorageBackend::in_memory();
        backend
            .store()
            .put(
                &ObjectPath::from("results/j2/users.json"),
                bytes::Bytes::from(r#"{"records":[{"id":1}]}"#).into(),
            )
            .await
            .unwrap();
        let files = ResultFileStore::new(&backend);
        assert_eq!(files.read_records("results/j2/users.json").await.unwrap(), vec![json!({"id": 1})]);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let files = ResultFileStore::new(&StorageBackend::in_memory());
        assert!(matches!(
            files.read_records("results/none.json").await,
            Err(BlobError::ObjectStore(object_store::Error::NotFound { .. }))
        ));
    }
}
