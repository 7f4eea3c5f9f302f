//! Local bounded-concurrency executor for accepted fetch jobs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ControllerError, SubmitError};
use crate::types::{IngestionJob, IngestionJobStatus, JobRequest};

/// Runs one kind of fetch job (one integration's API client, typically).
#[async_trait]
pub trait Controller: Send + Sync {
    fn name(&self) -> &str;

    /// Reject requests this controller can never run.
    fn validate(&self, _request: &JobRequest) -> Result<(), String> {
        Ok(())
    }

    async fn ingest(&self, request: &JobRequest) -> Result<Option<serde_json::Value>, ControllerError>;
}

/// What the agent control service needs from an engine.
#[async_trait]
pub trait IngestionEngine: Send + Sync {
    fn controller_names(&self) -> Vec<String>;

    /// Non-blocking capacity check.
    fn can_accept_jobs(&self) -> bool;

    fn running_jobs(&self) -> usize;

    fn max_concurrent_jobs(&self) -> usize;

    /// Hand a request off for execution. Returns once the job is started,
    /// not when it finishes.
    async fn submit(&self, request: JobRequest) -> Result<(), SubmitError>;

    /// Every job the engine still tracks, finished or not.
    async fn jobs(&self) -> Vec<IngestionJob>;

    /// Forget finished jobs. Unknown or still-running ids are skipped.
    async fn clear_jobs(&self, job_ids: &[String]) -> usize;
}

// ── Throttle ────────────────────────────────────────────────────────

/// Fixed one-second window counter. `max == 0` disables it.
#[derive(Debug)]
struct Throttle {
    max_per_sec: u32,
    window_start: Instant,
    count: u32,
}

impl Throttle {
    fn new(max_per_sec: u32) -> Self {
        Self {
            max_per_sec,
            window_start: Instant::now(),
            count: 0,
        }
    }

    fn admit(&mut self, now: Instant) -> bool {
        if self.max_per_sec == 0 {
            return true;
        }
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= self.max_per_sec {
            return false;
        }
        self.count += 1;
        true
    }
}

// ── LocalIngestionEngine ────────────────────────────────────────────

#[derive(Default)]
struct JobTable {
    jobs: BTreeMap<String, IngestionJob>,
    handles: HashMap<String, JoinHandle<()>>,
}

pub struct LocalIngestionEngine {
    controllers: HashMap<String, Arc<dyn Controller>>,
    permits: Arc<Semaphore>,
    max_concurrent_jobs: usize,
    throttle: Mutex<Throttle>,
    table: Arc<Mutex<JobTable>>,
}

impl LocalIngestionEngine {
    pub fn new(max_concurrent_jobs: usize, max_submissions_per_sec: u32) -> Self {
        let max_concurrent_jobs = max_concurrent_jobs.max(1);
        Self {
            controllers: HashMap::new(),
            permits: Arc::new(Semaphore::new(max_concurrent_jobs)),
            max_concurrent_jobs,
            throttle: Mutex::new(Throttle::new(max_submissions_per_sec)),
            table: Arc::new(Mutex::new(JobTable::default())),
        }
    }

    /// Register a controller under its own name, replacing any previous one.
    pub fn with_controller(mut self, controller: impl Controller + 'static) -> Self {
        self.controllers
            .insert(controller.name().to_string(), Arc::new(controller));
        self
    }

    /// Abort a running job. Returns `false` if it is unknown or already done.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Ok(mut table) = self.table.lock() else {
            return false;
        };
        let Some(job) = table.jobs.get_mut(job_id) else {
            return false;
        };
        if job.done {
            return false;
        }
        job.finish(IngestionJobStatus::Canceled);
        if let Some(handle) = table.handles.remove(job_id) {
            handle.abort();
        }
        info!(job_id, "ingestion job canceled");
        true
    }

    fn lock_table(&self) -> Result<MutexGuard<'_, JobTable>, SubmitError> {
        self.table
            .lock()
            .map_err(|_| SubmitError::Internal("job table lock poisoned".into()))
    }
}

fn record_outcome(
    table: &Mutex<JobTable>,
    job_id: &str,
    outcome: Result<Option<serde_json::Value>, ControllerError>,
) {
    let Ok(mut table) = table.lock() else {
        warn!(job_id, "job table lock poisoned, outcome dropped");
        return;
    };
    table.handles.remove(job_id);
    let Some(job) = table.jobs.get_mut(job_id) else {
        return;
    };
    // Canceled jobs keep their status.
    if job.done {
        return;
    }
    match outcome {
        Ok(result) => {
            job.result = result;
            job.finish(IngestionJobStatus::Success);
            info!(job_id, "ingestion job succeeded");
        }
        Err(e) => {
            job.error = Some(e.to_string());
            job.finish(IngestionJobStatus::Failure);
            warn!(job_id, error = %e, "ingestion job failed");
        }
    }
}

#[async_trait]
impl IngestionEngine for LocalIngestionEngine {
    fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.controllers.keys().cloned().collect();
        names.sort();
        names
    }

    fn can_accept_jobs(&self) -> bool {
        self.permits.available_permits() > 0
    }

    fn running_jobs(&self) -> usize {
        self.max_concurrent_jobs - self.permits.available_permits()
    }

    fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    async fn submit(&self, request: JobRequest) -> Result<(), SubmitError> {
        let controller = self
            .controllers
            .get(&request.controller_name)
            .cloned()
            .ok_or_else(|| SubmitError::Invalid(format!("unknown controller `{}`", request.controller_name)))?;
        controller.validate(&request).map_err(SubmitError::Invalid)?;

        let job_id = request.job_id.clone();
        let mut table = self.lock_table()?;
        if table.jobs.contains_key(&job_id) {
            return Err(SubmitError::Invalid(format!("job `{job_id}` already submitted")));
        }

        let permit = self
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| SubmitError::RateLimited)?;

        // Only submissions that would otherwise start use up a throttle slot.
        {
            let mut throttle = self
                .throttle
                .lock()
                .map_err(|_| SubmitError::Internal("throttle lock poisoned".into()))?;
            if !throttle.admit(Instant::now()) {
                debug!(job_id = %job_id, "submission rate exceeded");
                return Err(SubmitError::RateLimited);
            }
        }

        table.jobs.insert(job_id.clone(), IngestionJob::running(&request));

        let shared = Arc::clone(&self.table);
        let task_job_id = job_id.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let outcome = controller.ingest(&request).await;
            record_outcome(&shared, &task_job_id, outcome);
        });
        // The task cannot record its outcome before this lock is released.
        table.handles.insert(job_id.clone(), handle);
        info!(job_id = %job_id, "ingestion job started");
        Ok(())
    }

    async fn jobs(&self) -> Vec<IngestionJob> {
        match self.table.lock() {
            Ok(table) => table.jobs.values().cloned().collect(),
            Err(_) => {
                warn!("job table lock poisoned");
                Vec::new()
            }
        }
    }

    async fn clear_jobs(&self, job_ids: &[String]) -> usize {
        let Ok(mut table) = self.table.lock() else {
            return 0;
        };
        let mut cleared = 0;
        for id in job_ids {
            if table.jobs.get(id).is_some_and(|j| j.done) {
                table.jobs.remove(id);
                cleared += 1;
            }
        }
        cleared
    }
}
