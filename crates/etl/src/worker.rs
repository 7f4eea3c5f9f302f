//! Polling ETL worker: claims due job instances and runs their pipelines.
//!
//! Each poll first returns abandoned `pending` instances (stale heartbeat
//! or past their timeout) to `scheduled`, then lists `scheduled` instances
//! that are due and still below their attempt limit, claims them with a
//! conditional update (`scheduled` → `pending`), and runs them one at a
//! time. While a job runs, a heartbeat task refreshes `last_heartbeat`.
//!
//! A failed run with attempts left goes back to `scheduled` after the
//! definition's retry wait and resumes from its checkpoints; only an
//! exhausted instance ends in `failure`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use sluice_core::config::EtlConfig;
use sluice_core::{
    JobDefinition, JobDefinitionParameters, JobInstance, JobInstanceFilter, JobInstanceId, JobInstanceUpdate,
    JobStatus,
};
use sluice_storage::{JobDefinitionStore, JobInstanceStore, JobStore, PayloadBlobStore, StoreError};

use crate::cache::RunCache;
use crate::context::JobContext;
use crate::error::PipelineError;
use crate::pipeline::ProcessorRegistry;

/// Final state of one job handled by the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobInstanceId,
    pub status: JobStatus,
    pub error: Option<String>,
}

pub struct EtlWorker<S> {
    store: Arc<S>,
    blobs: Arc<dyn PayloadBlobStore>,
    registry: ProcessorRegistry,
    config: EtlConfig,
}

impl<S> EtlWorker<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: Arc<S>, blobs: Arc<dyn PayloadBlobStore>, registry: ProcessorRegistry, config: EtlConfig) -> Self {
        Self {
            store,
            blobs,
            registry,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        info!(
            worker_id = %self.config.worker_id,
            processors = ?self.registry.names(),
            poll_secs = interval.as_secs(),
            "ETL worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.poll_once().await {
                Ok(outcomes) if !outcomes.is_empty() => {
                    debug!(count = outcomes.len(), "poll finished");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "failed to poll for due jobs"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "ETL worker stopped");
    }

    /// One poll: reclaim abandoned instances, then claim and run every due
    /// instance in priority order.
    pub async fn poll_once(&self) -> Result<Vec<JobOutcome>, StoreError> {
        match self.reclaim_abandoned().await {
            Ok(0) => {}
            Ok(count) => info!(count, "reclaimed abandoned jobs"),
            Err(e) => warn!(error = %e, "failed to reclaim abandoned jobs"),
        }

        let filter = JobInstanceFilter {
            statuses: Some(vec![JobStatus::Scheduled]),
            below_max_attempts: true,
            scheduled_at_or_before: Some(Utc::now()),
            limit: Some(self.config.max_jobs_per_poll.max(1)),
            ..Default::default()
        };
        let due = self.store.list_instances(&filter).await?;

        let mut outcomes = Vec::new();
        for instance in due {
            if !self.claim(&instance.id).await? {
                debug!(job_id = %instance.id, "job claimed elsewhere, skipping");
                continue;
            }
            outcomes.push(self.run_claimed(instance).await);
        }
        Ok(outcomes)
    }

    /// Reschedule `pending` instances whose worker went quiet or overran
    /// the timeout. Exhausted ones are failed instead.
    pub async fn reclaim_abandoned(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let stale_secs = i64::try_from(self.config.stale_heartbeat_secs).unwrap_or(i64::MAX);
        let stale_before = now - chrono::Duration::seconds(stale_secs);

        let mut abandoned = self
            .store
            .list_instances(&JobInstanceFilter {
                statuses: Some(vec![JobStatus::Pending]),
                last_heartbeat_before: Some(stale_before),
                ..Default::default()
            })
            .await?;
        abandoned.extend(
            self.store
                .list_instances(&JobInstanceFilter {
                    statuses: Some(vec![JobStatus::Pending]),
                    timed_out_as_of: Some(now),
                    ..Default::default()
                })
                .await?,
        );

        let mut reclaimed = 0;
        for instance in abandoned {
            let (status, scheduled) = if instance.has_attempts_left() {
                (JobStatus::Scheduled, Some(now))
            } else {
                (JobStatus::Failure, None)
            };
            // Conditions keep a row listed twice from being reclaimed twice.
            let update = JobInstanceUpdate {
                status: Some(status),
                scheduled_start_time: scheduled,
                status_condition: Some(JobStatus::Pending),
                worker_id_condition: instance.worker_id.clone(),
                ..Default::default()
            };
            if self.store.update_instance(&instance.id, &update).await? {
                warn!(
                    job_id = %instance.id,
                    previous_worker = instance.worker_id.as_deref().unwrap_or("-"),
                    status = %status,
                    "abandoned job reclaimed"
                );
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn claim(&self, id: &JobInstanceId) -> Result<bool, StoreError> {
        let now = Utc::now();
        let update = JobInstanceUpdate {
            status: Some(JobStatus::Pending),
            worker_id: Some(self.config.worker_id.clone()),
            increment_attempt_count: true,
            start_time: Some(now),
            heartbeat: Some(now),
            status_condition: Some(JobStatus::Scheduled),
            ..Default::default()
        };
        self.store.update_instance(id, &update).await
    }

    async fn run_claimed(&self, instance: JobInstance) -> JobOutcome {
        let job_id = instance.id;
        // The claim already counted this attempt.
        let attempts_left = instance.attempt_count + 1 < instance.attempt_max;
        let definition = self.load_definition(&instance).await;

        let heartbeat = self.spawn_heartbeat(job_id);
        let result = self.execute(instance, definition.as_ref()).await;
        heartbeat.abort();

        match result {
            Ok(status) => {
                self.finish(&job_id, status, None).await;
                JobOutcome {
                    job_id,
                    status,
                    error: None,
                }
            }
            Err(e) if attempts_left && e.is_retryable() => {
                let wait = definition
                    .as_ref()
                    .map_or(JobDefinitionParameters::default().retry_wait_minutes, |d| {
                        d.parameters.retry_wait_minutes
                    });
                let retry_at = Utc::now() + chrono::Duration::minutes(i64::from(wait.max(0)));
                warn!(job_id = %job_id, error = %e, retry_at = %retry_at, "job failed, will retry");
                self.finish(&job_id, JobStatus::Scheduled, Some(retry_at)).await;
                JobOutcome {
                    job_id,
                    status: JobStatus::Scheduled,
                    error: Some(e.to_string()),
                }
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "job failed");
                self.finish(&job_id, JobStatus::Failure, None).await;
                JobOutcome {
                    job_id,
                    status: JobStatus::Failure,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn load_definition(&self, instance: &JobInstance) -> Option<JobDefinition> {
        match self.store.get_definition(instance.id.job_definition_id).await {
            Ok(definition) => definition,
            Err(e) => {
                warn!(job_id = %instance.id, error = %e, "could not load job definition");
                None
            }
        }
    }

    async fn execute(&self, instance: JobInstance, definition: Option<&JobDefinition>) -> Result<JobStatus, PipelineError> {
        let runner = self
            .registry
            .get(&instance.processor_name)
            .ok_or_else(|| PipelineError::UnknownProcessor(instance.processor_name.clone()))?;

        let store: Arc<dyn JobInstanceStore> = self.store.clone();
        let ctx = JobContext::with_batch_size(instance, store, self.config.progress_detail_batch_size)
            .with_definition_metadata(definition.map(|d| d.metadata.clone()).unwrap_or_default());

        let mut cache = RunCache::new();
        let mut ctx = ctx
            .with_rehydrated_payload(self.blobs.as_ref(), runner.payload_generator(), &mut cache)
            .await?;
        drop(cache);

        runner.run(&mut ctx).await?;
        if ctx.has_failed_progress_details() {
            Ok(JobStatus::PartialSuccess)
        } else {
            Ok(JobStatus::Success)
        }
    }

    async fn finish(&self, id: &JobInstanceId, status: JobStatus, retry_at: Option<DateTime<Utc>>) {
        let update = JobInstanceUpdate {
            status: Some(status),
            scheduled_start_time: retry_at,
            worker_id_condition: Some(self.config.worker_id.clone()),
            ..Default::default()
        };
        match self.store.update_instance(id, &update).await {
            Ok(true) => info!(job_id = %id, status = %status, "job status recorded"),
            Ok(false) => warn!(job_id = %id, status = %status, "job no longer owned by this worker"),
            Err(e) => error!(job_id = %id, error = %e, "failed to record job status"),
        }
    }

    fn spawn_heartbeat(&self, job_id: JobInstanceId) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.config.worker_id.clone();
        let every = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick fires immediately; the claim already set the heartbeat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let update = JobInstanceUpdate {
                    heartbeat: Some(Utc::now()),
                    worker_id_condition: Some(worker_id.clone()),
                    ..Default::default()
                };
                if let Err(e) = store.update_instance(&job_id, &update).await {
                    warn!(job_id = %job_id, error = %e, "heartbeat failed");
                }
            }
        })
    }
}
