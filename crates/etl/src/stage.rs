use async_trait::async_trait;

use crate::context::JobContext;
use crate::error::StageError;

/// One named step of a processing pipeline.
///
/// `S` is the processor's mutable job state, created once per run and
/// threaded through every stage in order. The stage name doubles as its
/// checkpoint key in the job instance's progress maps.
#[async_trait]
pub trait Stage<S: Send>: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_stage(&self, _ctx: &mut JobContext, _state: &mut S) -> Result<(), StageError> {
        Ok(())
    }

    async fn process(&self, ctx: &mut JobContext, state: &mut S) -> Result<(), StageError>;

    async fn post_stage(&self, _ctx: &mut JobContext, _state: &mut S) -> Result<(), StageError> {
        Ok(())
    }
}

/// Owner of a stage sequence: creates the job state and wraps the run.
#[async_trait]
pub trait Processor: Send + Sync {
    type State: Send;

    /// Registry key; matches `processor_name` on job definitions.
    fn name(&self) -> &str;

    fn create_state(&self, ctx: &JobContext) -> Self::State;

    async fn pre_process(&self, _ctx: &mut JobContext, _state: &mut Self::State) -> Result<(), StageError> {
        Ok(())
    }

    async fn post_process(&self, _ctx: &mut JobContext, _state: &mut Self::State) -> Result<(), StageError> {
        Ok(())
    }
}
