//! Stage over the result files listed in a job's payload.
//!
//! The payload carries `{"files": [{"index", "data_type",
//! "ingestion_job_id", "location"}, ...]}`. A [`FileStage`] hands every
//! record of each matching file to an [`EntityProcessor`], records a
//! per-file detail through the batched progress writer, and checkpoints the
//! last finished file index so a rerun skips what is already done.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use sluice_core::{EntityCounts, FileProgressDetail, Payload};
use sluice_storage::ResultFileStore;

use crate::context::JobContext;
use crate::error::StageError;
use crate::stage::Stage;

/// Failure messages kept per file detail.
const MAX_RECORDED_FAILURES: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub index: u32,
    pub data_type: String,
    #[serde(default)]
    pub ingestion_job_id: Option<String>,
    pub location: String,
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<PayloadFile>,
}

/// Files listed in `payload`, ordered by index.
pub fn payload_files(payload: &Payload) -> Result<Vec<PayloadFile>, StageError> {
    let list: FileList = serde_json::from_value(payload.as_value().clone())
        .map_err(|e| StageError::failed(format!("malformed file list in payload: {e}")))?;
    let mut files = list.files;
    files.sort_by_key(|f| f.index);
    Ok(files)
}

// ── Collaborators ────────────────────────────────────────────────────

#[async_trait]
pub trait FileReader: Send + Sync {
    async fn read_records(&self, file: &PayloadFile) -> Result<Vec<serde_json::Value>, StageError>;
}

#[async_trait]
impl FileReader for ResultFileStore {
    async fn read_records(&self, file: &PayloadFile) -> Result<Vec<serde_json::Value>, StageError> {
        ResultFileStore::read_records(self, &file.location)
            .await
            .map_err(|e| StageError::failed(e.to_string()))
    }
}

/// Per-record logic of a [`FileStage`].
///
/// Returning [`StageError::Failed`] counts the record as failed and moves
/// on; any other error aborts the stage.
#[async_trait]
pub trait EntityProcessor<S: Send>: Send + Sync {
    /// Only files of this data type are processed.
    fn data_type(&self) -> &str;

    /// Restrict the run to files from the most recent ingestion job.
    fn only_latest_ingestion_job(&self) -> bool {
        false
    }

    async fn process_entity(
        &self,
        ctx: &mut JobContext,
        state: &mut S,
        ingestion_job_id: Option<&str>,
        entity: serde_json::Value,
    ) -> Result<(), StageError>;
}

// ── Stage ────────────────────────────────────────────────────────────

pub struct FileStage<P> {
    name: String,
    reader: Arc<dyn FileReader>,
    entities: P,
}

impl<P> FileStage<P> {
    pub fn new(name: impl Into<String>, reader: Arc<dyn FileReader>, entities: P) -> Self {
        Self {
            name: name.into(),
            reader,
            entities,
        }
    }

    fn select<'a, S: Send>(&self, files: &'a [PayloadFile]) -> Vec<&'a PayloadFile>
    where
        P: EntityProcessor<S>,
    {
        let matching: Vec<&PayloadFile> = files
            .iter()
            .filter(|f| f.data_type == self.entities.data_type())
            .collect();
        if !self.entities.only_latest_ingestion_job() {
            return matching;
        }
        let latest = matching.last().and_then(|f| f.ingestion_job_id.clone());
        matching
            .into_iter()
            .filter(|f| f.ingestion_job_id == latest)
            .collect()
    }
}

#[async_trait]
impl<S, P> Stage<S> for FileStage<P>
where
    S: Send,
    P: EntityProcessor<S>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut JobContext, state: &mut S) -> Result<(), StageError> {
        let job_id = ctx.id();
        let files = match ctx.payload() {
            Some(payload) => payload_files(payload)?,
            None => return Err(StageError::failed(format!("job {job_id} has no payload"))),
        };
        if !ctx.add_stage_to_progress_detail(&self.name).await? {
            warn!(job_id = %job_id, stage = %self.name, "progress detail entry not persisted");
        }

        let done = ctx.get_stage_progress(&self.name)?;
        let pending = self
            .select::<S>(&files)
            .into_iter()
            .filter(|f| done.map_or(true, |d| i64::from(f.index) > d));

        for file in pending {
            let started = Instant::now();
            let mut detail = match self.reader.read_records(file).await {
                Ok(records) => self.process_file(ctx, state, file, records).await?,
                Err(e) => {
                    warn!(job_id = %job_id, stage = %self.name, file = file.index, error = %e, "result file unreadable");
                    FileProgressDetail::unreadable(e.to_string())
                }
            };
            detail.duration_ms = started.elapsed().as_millis() as u64;
            ctx.batch_update_progress_detail(&self.name, file.index, detail).await?;
            ctx.set_stage_progress(&self.name, i64::from(file.index)).await?;
        }

        // Files of other data types count as done too.
        if let Some(last) = files.last().map(|f| i64::from(f.index)) {
            if ctx.get_stage_progress(&self.name)?.map_or(true, |d| d < last) {
                ctx.set_stage_progress(&self.name, last).await?;
            }
        }
        Ok(())
    }
}

impl<P> FileStage<P> {
    async fn process_file<S: Send>(
        &self,
        ctx: &mut JobContext,
        state: &mut S,
        file: &PayloadFile,
        records: Vec<serde_json::Value>,
    ) -> Result<FileProgressDetail, StageError>
    where
        P: EntityProcessor<S>,
    {
        let mut counts = EntityCounts::default();
        let mut failures = Vec::new();
        for entity in records {
            counts.total += 1;
            match self
                .entities
                .process_entity(ctx, state, file.ingestion_job_id.as_deref(), entity)
                .await
            {
                Ok(()) => counts.successful += 1,
                Err(StageError::Failed(msg)) => {
                    counts.failed += 1;
                    if failures.len() < MAX_RECORDED_FAILURES {
                        failures.push(msg);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        debug!(job_id = %ctx.id(), stage = %self.name, file = file.index, total = counts.total, failed = counts.failed, "file processed");
        Ok(FileProgressDetail {
            entities: counts,
            duration_ms: 0,
            failures,
        })
    }
}
