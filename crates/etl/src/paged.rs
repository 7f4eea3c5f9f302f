use async_trait::async_trait;
use tracing::{debug, warn};

use crate::context::JobContext;
use crate::error::StageError;
use crate::stage::Stage;

/// Source of fixed-size pages for a [`PagedStage`].
#[async_trait]
pub trait PageProcessor<S: Send>: Send + Sync {
    /// Process the page starting at `offset`. Returns `true` when more
    /// pages remain.
    async fn process_page(
        &self,
        ctx: &mut JobContext,
        state: &mut S,
        offset: i64,
        page_size: i64,
    ) -> Result<bool, StageError>;
}

/// Stage that walks pages and checkpoints the offset before each one.
///
/// A rerun starts at the last recorded offset, so at most one page is
/// processed twice after a crash.
pub struct PagedStage<P> {
    name: String,
    page_size: i64,
    pages: P,
}

impl<P> PagedStage<P> {
    pub fn new(name: impl Into<String>, page_size: i64, pages: P) -> Self {
        Self {
            name: name.into(),
            page_size: page_size.max(1),
            pages,
        }
    }
}

#[async_trait]
impl<S, P> Stage<S> for PagedStage<P>
where
    S: Send,
    P: PageProcessor<S>,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, ctx: &mut JobContext, state: &mut S) -> Result<(), StageError> {
        let mut offset = ctx.get_stage_progress(&self.name)?.unwrap_or(0);
        if offset > 0 {
            debug!(job_id = %ctx.id(), stage = %self.name, offset, "resuming from checkpoint");
        }
        loop {
            if !ctx.set_stage_progress(&self.name, offset).await? {
                warn!(job_id = %ctx.id(), stage = %self.name, offset, "offset checkpoint not persisted");
            }
            let more = self.pages.process_page(ctx, state, offset, self.page_size).await?;
            if !more {
                return Ok(());
            }
            offset += self.page_size;
        }
    }
}
