use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::SyncError;
use crate::source::TriggerSource;
use crate::sync::{SyncReport, TriggerSynchronizer};

/// Periodic driver: fetch triggers, reconcile, sleep.
///
/// Passes run one after another on a single task, so two passes never
/// overlap.
pub struct SyncRunner {
    source: Arc<dyn TriggerSource>,
    synchronizer: TriggerSynchronizer,
    interval: Duration,
}

impl SyncRunner {
    pub fn new(source: Arc<dyn TriggerSource>, synchronizer: TriggerSynchronizer, interval: Duration) -> Self {
        Self {
            source,
            synchronizer,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    pub async fn run_once(&self) -> Result<SyncReport, SyncError> {
        let triggers = self.source.fetch_triggers().await?;
        info!(count = triggers.len(), "fetched ingestion triggers");
        self.synchronizer.sync(&triggers).await
    }

    /// Loop until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "trigger sync loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                warn!(error = %e, "trigger sync pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("trigger sync loop stopped");
    }
}
