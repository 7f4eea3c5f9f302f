use thiserror::Error;

use sluice_core::{JobInstanceId, JobType};
use sluice_storage::{BlobError, StoreError};

/// Failures raised by [`crate::JobContext`].
#[derive(Error, Debug)]
pub enum JobContextError {
    #[error("stage progress is unsupported for generic job {job_id} ({job_type})")]
    UnsupportedForGenericJob { job_id: JobInstanceId, job_type: JobType },

    #[error("job instance not found: {0}")]
    InstanceNotFound(JobInstanceId),

    #[error("no payload available for job {0} and no generator registered")]
    MissingPayload(JobInstanceId),

    #[error("payload generation failed: {0}")]
    PayloadGeneration(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("blob error: {0}")]
    Blob(#[from] BlobError),
}

/// Failure inside a stage or a processor hook.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Context(#[from] JobContextError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl StageError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("duplicate processor name: {0}")]
    DuplicateProcessor(String),

    #[error("unknown processor: {0}")]
    UnknownProcessor(String),

    #[error("pre_process failed: {0}")]
    PreProcess(#[source] StageError),

    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: StageError,
    },

    #[error("post_process failed: {0}")]
    PostProcess(#[source] StageError),

    #[error(transparent)]
    Context(#[from] JobContextError),
}

impl PipelineError {
    /// Whether running the same instance again could succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::UnknownProcessor(_) | PipelineError::DuplicateStage(_) | PipelineError::DuplicateProcessor(_)
        )
    }
}
