//! Per-run job handle with persistently checkpointed progress.
//!
//! A [`JobContext`] is built from a stored [`JobInstance`] at the start of
//! a run and is never persisted itself. Staged jobs carry their progress
//! maps in [`JobKind::Staged`]; every write goes through a [`Checkpoint`]
//! borrowed mutably from the context, so one run owns the batching buffer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use sluice_core::{
    FileProgressDetail, IntegrationType, JobInstance, JobInstanceId, JobInstanceUpdate, JobType,
    Metadata, Payload, ProgressDetailMap, ProgressMap, StageProgressDetail,
};
use sluice_storage::{JobInstanceStore, PayloadBlobStore};

use crate::batcher::DetailBatcher;
use crate::cache::RunCache;
use crate::error::JobContextError;

// ── Kind ─────────────────────────────────────────────────────────────

/// Progress state owned by a staged job run.
#[derive(Debug, Clone)]
pub struct StagedProgress {
    progress: ProgressMap,
    details: ProgressDetailMap,
    batcher: DetailBatcher,
}

impl StagedProgress {
    pub fn new(progress: ProgressMap, details: ProgressDetailMap, batch_size: usize) -> Self {
        Self {
            progress,
            details,
            batcher: DetailBatcher::new(batch_size),
        }
    }
}

#[derive(Debug, Clone)]
pub enum JobKind {
    /// No stage checkpoints.
    Generic,
    Staged(StagedProgress),
}

// ── Payload generation ───────────────────────────────────────────────

/// Synthesizes a payload when neither the instance nor blob storage has one.
#[async_trait]
pub trait PayloadGenerator: Send + Sync {
    async fn generate_payload(&self, ctx: &JobContext, cache: &mut RunCache) -> Result<Payload, JobContextError>;
}

// ── Context ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct JobContext {
    instance: JobInstance,
    definition_metadata: Metadata,
    kind: JobKind,
    store: Arc<dyn JobInstanceStore>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.instance.id)
            .field("job_type", &self.instance.job_type)
            .field("kind", &self.kind)
            .finish()
    }
}

impl JobContext {
    pub fn new(instance: JobInstance, store: Arc<dyn JobInstanceStore>) -> Self {
        Self::with_batch_size(instance, store, crate::batcher::DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(mut instance: JobInstance, store: Arc<dyn JobInstanceStore>, batch_size: usize) -> Self {
        let kind = if instance.job_type.is_generic() {
            JobKind::Generic
        } else {
            JobKind::Staged(StagedProgress::new(
                std::mem::take(&mut instance.progress),
                std::mem::take(&mut instance.progress_details),
                batch_size,
            ))
        };
        Self {
            instance,
            definition_metadata: Metadata::new(),
            kind,
            store,
        }
    }

    pub fn with_definition_metadata(mut self, metadata: Metadata) -> Self {
        self.definition_metadata = metadata;
        self
    }

    pub fn id(&self) -> JobInstanceId {
        self.instance.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.instance.tenant_id
    }

    pub fn integration_id(&self) -> Option<&str> {
        self.instance.integration_id.as_deref()
    }

    pub fn integration_type(&self) -> Option<&IntegrationType> {
        self.instance.integration_type.as_ref()
    }

    pub fn job_type(&self) -> JobType {
        self.instance.job_type
    }

    pub fn processor_name(&self) -> &str {
        &self.instance.processor_name
    }

    pub fn scheduled_start_time(&self) -> DateTime<Utc> {
        self.instance.scheduled_start_time
    }

    pub fn is_full(&self) -> bool {
        self.instance.is_full
    }

    pub fn is_reprocessing(&self) -> bool {
        self.instance.is_reprocessing
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.instance.payload.as_ref()
    }

    pub fn payload_reference(&self) -> Option<&str> {
        self.instance.payload_reference.as_deref()
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn is_generic(&self) -> bool {
        matches!(self.kind, JobKind::Generic)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.instance.metadata
    }

    /// Metadata of the owning job definition.
    pub fn definition_metadata(&self) -> &Metadata {
        &self.definition_metadata
    }

    /// Set one instance metadata key and persist the whole metadata map.
    /// Returns `false` when the write did not land; the in-memory value stays.
    pub async fn set_metadata_value(&mut self, key: &str, value: serde_json::Value) -> bool {
        self.instance.metadata.insert(key.to_string(), value);
        let update = JobInstanceUpdate {
            metadata: Some(self.instance.metadata.clone()),
            ..Default::default()
        };
        persist(self.store.as_ref(), &self.instance.id, &update, "metadata").await
    }

    /// Progress handle; fails fast for generic jobs.
    pub fn checkpoint(&mut self) -> Result<Checkpoint<'_>, JobContextError> {
        let job_id = self.instance.id;
        let job_type = self.instance.job_type;
        match &mut self.kind {
            JobKind::Staged(progress) => Ok(Checkpoint {
                job_id,
                store: self.store.as_ref(),
                progress,
            }),
            JobKind::Generic => Err(JobContextError::UnsupportedForGenericJob { job_id, job_type }),
        }
    }

    fn staged(&self) -> Result<&StagedProgress, JobContextError> {
        match &self.kind {
            JobKind::Staged(progress) => Ok(progress),
            JobKind::Generic => Err(self.unsupported()),
        }
    }

    fn unsupported(&self) -> JobContextError {
        JobContextError::UnsupportedForGenericJob {
            job_id: self.instance.id,
            job_type: self.instance.job_type,
        }
    }

    // ── Progress accessors ───────────────────────────────────────────

    pub fn get_stage_progress(&self, stage: &str) -> Result<Option<i64>, JobContextError> {
        Ok(self.staged()?.progress.get(stage).copied())
    }

    pub fn stage_progress_detail(&self, stage: &str) -> Result<Option<&StageProgressDetail>, JobContextError> {
        Ok(self.staged()?.details.get(stage))
    }

    /// Whether any recorded file detail shows failed or unreadable input.
    /// Always `false` for generic jobs.
    pub fn has_failed_progress_details(&self) -> bool {
        match &self.kind {
            JobKind::Staged(progress) => progress.details.values().any(StageProgressDetail::has_failures),
            JobKind::Generic => false,
        }
    }

    /// Buffered detail updates not yet written.
    pub fn pending_detail_updates(&self) -> Result<usize, JobContextError> {
        Ok(self.staged()?.batcher.pending())
    }

    pub async fn set_stage_progress(&mut self, stage: &str, value: i64) -> Result<bool, JobContextError> {
        Ok(self.checkpoint()?.set_stage_progress(stage, value).await)
    }

    pub async fn add_stage_to_progress_detail(&mut self, stage: &str) -> Result<bool, JobContextError> {
        Ok(self.checkpoint()?.add_stage_to_progress_detail(stage).await)
    }

    pub async fn batch_update_progress_detail(
        &mut self,
        stage: &str,
        file_index: u32,
        detail: FileProgressDetail,
    ) -> Result<bool, JobContextError> {
        Ok(self
            .checkpoint()?
            .batch_update_progress_detail(stage, file_index, detail)
            .await)
    }

    pub async fn flush_progress_detail_updates(&mut self) -> Result<bool, JobContextError> {
        Ok(self.checkpoint()?.flush_progress_detail_updates().await)
    }

    pub async fn update_progress_detail(
        &mut self,
        stage: &str,
        file_index: u32,
        detail: FileProgressDetail,
    ) -> Result<bool, JobContextError> {
        Ok(self.checkpoint()?.update_progress_detail(stage, file_index, detail).await)
    }

    // ── Payload ──────────────────────────────────────────────────────

    /// Return a context whose payload is loaded, leaving `self` untouched.
    ///
    /// Generic jobs and contexts that already hold a payload come back as
    /// an unchanged copy. Otherwise the stored instance is consulted: an
    /// inline payload wins, then the blob reference, and finally
    /// `generator` synthesizes one, which is uploaded and its reference
    /// recorded on the instance.
    pub async fn with_rehydrated_payload(
        &self,
        blobs: &dyn PayloadBlobStore,
        generator: Option<&dyn PayloadGenerator>,
        cache: &mut RunCache,
    ) -> Result<JobContext, JobContextError> {
        if self.is_generic() || self.instance.payload.is_some() {
            return Ok(self.clone());
        }

        let job_id = self.instance.id;
        let stored = self
            .store
            .get_instance(&job_id)
            .await?
            .ok_or(JobContextError::InstanceNotFound(job_id))?;

        let mut next = self.clone();

        if let Some(payload) = stored.payload {
            debug!(job_id = %job_id, "payload loaded inline");
            next.instance.payload = Some(payload);
            return Ok(next);
        }

        if let Some(reference) = stored.payload_reference.as_deref() {
            match blobs.download_payload(reference).await? {
                Some(payload) => {
                    debug!(job_id = %job_id, reference, "payload downloaded");
                    next.instance.payload = Some(payload);
                    next.instance.payload_reference = Some(reference.to_string());
                    return Ok(next);
                }
                None => {
                    warn!(job_id = %job_id, reference, "payload blob missing, regenerating");
                }
            }
        }

        let generator = generator.ok_or(JobContextError::MissingPayload(job_id))?;
        let payload = generator.generate_payload(self, cache).await?;
        let reference = blobs.upload_payload(&job_id, &payload).await?;

        let update = JobInstanceUpdate {
            payload_reference: Some(reference.clone()),
            ..Default::default()
        };
        if !self.store.update_instance(&job_id, &update).await? {
            warn!(job_id = %job_id, "job instance vanished while recording payload reference");
        }
        info!(job_id = %job_id, reference = %reference, "payload generated and uploaded");

        next.instance.payload = Some(payload);
        next.instance.payload_reference = Some(reference);
        Ok(next)
    }
}

// ── Checkpoint ───────────────────────────────────────────────────────

/// Mutable progress handle for a staged job.
pub struct Checkpoint<'a> {
    job_id: JobInstanceId,
    store: &'a dyn JobInstanceStore,
    progress: &'a mut StagedProgress,
}

impl Checkpoint<'_> {
    pub fn get_stage_progress(&self, stage: &str) -> Option<i64> {
        self.progress.progress.get(stage).copied()
    }

    pub fn progress_detail(&self, stage: &str) -> Option<&StageProgressDetail> {
        self.progress.details.get(stage)
    }

    /// Set one stage counter and persist the whole progress map.
    pub async fn set_stage_progress(&mut self, stage: &str, value: i64) -> bool {
        self.progress.progress.insert(stage.to_string(), value);
        let update = JobInstanceUpdate {
            progress: Some(self.progress.progress.clone()),
            ..Default::default()
        };
        persist(self.store, &self.job_id, &update, "stage progress").await
    }

    /// Ensure `stage` has a detail entry; a new entry is written immediately.
    pub async fn add_stage_to_progress_detail(&mut self, stage: &str) -> bool {
        if self.progress.details.contains_key(stage) {
            return true;
        }
        self.progress
            .details
            .insert(stage.to_string(), StageProgressDetail::default());
        self.write_details().await
    }

    /// Record a file detail in memory; every Nth call persists the batch.
    pub async fn batch_update_progress_detail(
        &mut self,
        stage: &str,
        file_index: u32,
        detail: FileProgressDetail,
    ) -> bool {
        self.put_detail(stage, file_index, detail);
        if self.progress.batcher.record() {
            self.flush_progress_detail_updates().await
        } else {
            true
        }
    }

    /// Persist buffered detail updates. Nothing pending means no write.
    pub async fn flush_progress_detail_updates(&mut self) -> bool {
        if self.progress.batcher.pending() == 0 {
            return true;
        }
        let ok = self.write_details().await;
        self.progress.batcher.reset();
        ok
    }

    /// Record a file detail and write immediately, including anything buffered.
    pub async fn update_progress_detail(&mut self, stage: &str, file_index: u32, detail: FileProgressDetail) -> bool {
        self.put_detail(stage, file_index, detail);
        let ok = self.write_details().await;
        self.progress.batcher.reset();
        ok
    }

    fn put_detail(&mut self, stage: &str, file_index: u32, detail: FileProgressDetail) {
        self.progress
            .details
            .entry(stage.to_string())
            .or_default()
            .file_progress
            .insert(file_index, detail);
    }

    async fn write_details(&self) -> bool {
        let update = JobInstanceUpdate {
            progress_details: Some(self.progress.details.clone()),
            ..Default::default()
        };
        persist(self.store, &self.job_id, &update, "progress detail").await
    }
}

/// Write `update`, turning store failures into a logged `false`.
async fn persist(store: &dyn JobInstanceStore, job_id: &JobInstanceId, update: &JobInstanceUpdate, what: &str) -> bool {
    match store.update_instance(job_id, update).await {
        Ok(true) => true,
        Ok(false) => {
            warn!(job_id = %job_id, what, "job instance not updated");
            false
        }
        Err(e) => {
            warn!(job_id = %job_id, what, error = %e, "failed to persist job progress");
            false
        }
    }
}
