//! Checkpointed, stage-based ETL execution.
//!
//! A [`Pipeline`] runs a [`Processor`]'s ordered [`Stage`]s against a
//! [`JobContext`], which persists stage progress to the job store so an
//! interrupted run resumes where it left off. [`EtlWorker`] polls the store
//! for due job instances and dispatches them through a [`ProcessorRegistry`].
//! [`PagedStage`] and [`FileStage`] are the two stock resumable stages.

pub mod batcher;
pub mod cache;
pub mod context;
pub mod error;
pub mod files;
pub mod paged;
pub mod pipeline;
pub mod stage;
pub mod worker;

pub use batcher::{DetailBatcher, DEFAULT_BATCH_SIZE};
pub use cache::RunCache;
pub use context::{Checkpoint, JobContext, JobKind, PayloadGenerator, StagedProgress};
pub use error::{JobContextError, PipelineError, StageError};
pub use files::{payload_files, EntityProcessor, FileReader, FileStage, PayloadFile};
pub use paged::{PageProcessor, PagedStage};
pub use pipeline::{JobRunner, Pipeline, PipelineBuilder, ProcessorRegistry, RunSummary};
pub use stage::{Processor, Stage};
pub use worker::{EtlWorker, JobOutcome};
