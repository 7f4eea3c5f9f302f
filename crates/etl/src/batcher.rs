//! Write batching for per-file progress details.
//!
//! Counts in-memory detail updates and signals a flush once the size
//! threshold is reached. Readers of the job instance never see more than
//! `batch_size - 1` unflushed updates.

/// Default number of detail updates between persisted writes.
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone)]
pub struct DetailBatcher {
    pending: usize,
    batch_size: usize,
}

impl DetailBatcher {
    /// A `batch_size` of zero is treated as one (flush on every update).
    pub fn new(batch_size: usize) -> Self {
        Self {
            pending: 0,
            batch_size: batch_size.max(1),
        }
    }

    /// Record one buffered update. Returns `true` when the batch is full.
    pub fn record(&mut self) -> bool {
        self.pending += 1;
        self.pending >= self.batch_size
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Reset after a flush attempt, successful or not.
    pub fn reset(&mut self) {
        self.pending = 0;
    }
}

impl Default for DetailBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE)
    }
}
