//! Persistence seams for job definitions, job instances and payload blobs.

use async_trait::async_trait;

use sluice_core::{
    JobDefinition, JobDefinitionFilter, JobDefinitionId, JobDefinitionUpdate, JobInstance,
    JobInstanceFilter, JobInstanceId, JobInstanceUpdate, NewJobInstance, Payload,
};

use crate::error::{BlobError, StoreError};

#[async_trait]
pub trait JobDefinitionStore: Send + Sync {
    async fn insert_definition(&self, definition: &JobDefinition) -> Result<(), StoreError>;

    /// Apply `update` to every definition matching its where clause.
    /// Returns the number of rows changed.
    async fn update_definition(&self, update: &JobDefinitionUpdate) -> Result<u64, StoreError>;

    async fn get_definition(&self, id: JobDefinitionId) -> Result<Option<JobDefinition>, StoreError>;

    async fn list_definitions(&self, filter: &JobDefinitionFilter) -> Result<Vec<JobDefinition>, StoreError>;
}

#[async_trait]
pub trait JobInstanceStore: Send + Sync {
    /// Insert a new instance; the store assigns the per-definition serial id.
    async fn insert_instance(&self, instance: NewJobInstance) -> Result<JobInstanceId, StoreError>;

    async fn get_instance(&self, id: &JobInstanceId) -> Result<Option<JobInstance>, StoreError>;

    /// Apply a partial update. `Ok(false)` when the row is missing or a
    /// condition on the update no longer holds.
    async fn update_instance(&self, id: &JobInstanceId, update: &JobInstanceUpdate) -> Result<bool, StoreError>;

    /// Instances matching `filter`, highest priority then earliest scheduled first.
    async fn list_instances(&self, filter: &JobInstanceFilter) -> Result<Vec<JobInstance>, StoreError>;
}

/// Both halves of the job store.
pub trait JobStore: JobDefinitionStore + JobInstanceStore {}

impl<T: JobDefinitionStore + JobInstanceStore> JobStore for T {}

#[async_trait]
pub trait PayloadBlobStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `reference`.
    async fn download_payload(&self, reference: &str) -> Result<Option<Payload>, BlobError>;

    /// Store `payload` for `instance` and return its reference.
    async fn upload_payload(&self, instance: &JobInstanceId, payload: &Payload) -> Result<String, BlobError>;
}
