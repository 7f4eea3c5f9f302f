//! Ordered stage execution around a processor's hooks.
//!
//! Run order is fixed: `pre_process`, then for every stage `pre_stage`,
//! `process`, `post_stage`, then `post_process`. Stages never run
//! concurrently and none is skipped. Buffered progress details are flushed
//! after each stage completes; an error aborts the run without flushing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::context::{JobContext, PayloadGenerator};
use crate::error::{PipelineError, StageError};
use crate::stage::{Processor, Stage};

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub processor: String,
    pub stages_run: Vec<String>,
    pub duration: Duration,
}

// ── Builder ──────────────────────────────────────────────────────────

pub struct PipelineBuilder<P: Processor> {
    processor: P,
    stages: Vec<Box<dyn Stage<P::State>>>,
    generator: Option<Arc<dyn PayloadGenerator>>,
}

impl<P: Processor> PipelineBuilder<P> {
    /// Append a stage; stages run in registration order.
    pub fn stage(mut self, stage: impl Stage<P::State> + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Generator used when a staged job arrives without a payload.
    pub fn payload_generator(mut self, generator: impl PayloadGenerator + 'static) -> Self {
        self.generator = Some(Arc::new(generator));
        self
    }

    /// Fails when two stages share a name, since names key the checkpoints.
    pub fn build(self) -> Result<Pipeline<P>, PipelineError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name().to_string()) {
                return Err(PipelineError::DuplicateStage(stage.name().to_string()));
            }
        }
        Ok(Pipeline {
            processor: self.processor,
            stages: self.stages,
            generator: self.generator,
        })
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────

pub struct Pipeline<P: Processor> {
    processor: P,
    stages: Vec<Box<dyn Stage<P::State>>>,
    generator: Option<Arc<dyn PayloadGenerator>>,
}

impl<P: Processor> Pipeline<P> {
    pub fn builder(processor: P) -> PipelineBuilder<P> {
        PipelineBuilder {
            processor,
            stages: Vec::new(),
            generator: None,
        }
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Execute every stage against `ctx` with a fresh processor state.
    pub async fn execute(&self, ctx: &mut JobContext) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        let processor = self.processor.name().to_string();
        let job_id = ctx.id();
        let mut state = self.processor.create_state(ctx);

        info!(job_id = %job_id, processor = %processor, stages = self.stages.len(), "pipeline starting");

        self.processor
            .pre_process(ctx, &mut state)
            .await
            .map_err(PipelineError::PreProcess)?;

        let mut stages_run = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            let name = stage.name();
            let stage_started = Instant::now();
            let fail = |source: StageError| {
                error!(job_id = %job_id, stage = name, error = %source, "stage failed");
                PipelineError::Stage {
                    stage: name.to_string(),
                    source,
                }
            };

            stage.pre_stage(ctx, &mut state).await.map_err(fail)?;
            stage.process(ctx, &mut state).await.map_err(fail)?;
            stage.post_stage(ctx, &mut state).await.map_err(fail)?;

            if !ctx.is_generic() && !ctx.flush_progress_detail_updates().await? {
                warn!(job_id = %job_id, stage = name, "progress detail flush did not persist");
            }

            info!(
                job_id = %job_id,
                stage = name,
                elapsed_ms = stage_started.elapsed().as_millis() as u64,
                "stage complete"
            );
            stages_run.push(name.to_string());
        }

        self.processor
            .post_process(ctx, &mut state)
            .await
            .map_err(PipelineError::PostProcess)?;

        let duration = started.elapsed();
        info!(job_id = %job_id, processor = %processor, elapsed_ms = duration.as_millis() as u64, "pipeline complete");

        Ok(RunSummary {
            processor,
            stages_run,
            duration,
        })
    }
}

// ── Type-erased runners ──────────────────────────────────────────────

/// A pipeline with its job state type erased, for registry lookup.
#[async_trait]
pub trait JobRunner: Send + Sync {
    fn processor_name(&self) -> &str;

    fn payload_generator(&self) -> Option<&dyn PayloadGenerator>;

    async fn run(&self, ctx: &mut JobContext) -> Result<RunSummary, PipelineError>;
}

#[async_trait]
impl<P> JobRunner for Pipeline<P>
where
    P: Processor + 'static,
{
    fn processor_name(&self) -> &str {
        self.processor.name()
    }

    fn payload_generator(&self) -> Option<&dyn PayloadGenerator> {
        self.generator.as_deref()
    }

    async fn run(&self, ctx: &mut JobContext) -> Result<RunSummary, PipelineError> {
        self.execute(ctx).await
    }
}

/// Pipelines keyed by processor name.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    runners: HashMap<String, Arc<dyn JobRunner>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, runner: impl JobRunner + 'static) -> Result<(), PipelineError> {
        let name = runner.processor_name().to_string();
        if self.runners.contains_key(&name) {
            return Err(PipelineError::DuplicateProcessor(name));
        }
        self.runners.insert(name, Arc::new(runner));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobRunner>> {
        self.runners.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
