//! Agent control loop: register/heartbeat, find, accept, submit, report.
//!
//! Each tick runs the five steps in order on one task. A step that fails
//! to reach the control plane is logged and abandoned for this tick; the
//! next tick retries. The only error that ends a tick early is a shutdown
//! arriving during the rate-limit backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use sluice_core::config::AgentSettings;

use crate::control_plane::ControlPlaneClient;
use crate::engine::IngestionEngine;
use crate::error::{AgentError, ControlPlaneError, SubmitError};
use crate::types::{AgentHandle, AgentTelemetry, JobRequest, RejectReason};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// A registration call succeeded this tick.
    pub registered: bool,
    pub heartbeat_sent: bool,
    /// Find/accept/submit were skipped, or stopped early, because the
    /// engine was full.
    pub engine_busy: bool,
    pub pulled: usize,
    pub accepted: usize,
    /// Accept returned "already claimed or gone".
    pub already_claimed: usize,
    pub submitted: usize,
    pub rejected_scheduled: usize,
    pub rejected_invalid: usize,
    pub reported: usize,
    pub cleared: usize,
}

pub struct AgentControlService {
    client: Arc<dyn ControlPlaneClient>,
    engine: Arc<dyn IngestionEngine>,
    settings: AgentSettings,
    registered: bool,
    started: Instant,
}

impl AgentControlService {
    pub fn new(client: Arc<dyn ControlPlaneClient>, engine: Arc<dyn IngestionEngine>, settings: AgentSettings) -> Self {
        Self {
            client,
            engine,
            settings,
            registered: false,
            started: Instant::now(),
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle::from_settings(&self.settings, self.engine.controller_names()).with_telemetry(AgentTelemetry {
            running_jobs: self.engine.running_jobs(),
            max_concurrent_jobs: self.engine.max_concurrent_jobs(),
            uptime_secs: self.started.elapsed().as_secs(),
        })
    }

    /// Tick every `scheduling_interval_secs` after a warm-up delay, until
    /// `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        if !self.settings.scheduling_enabled {
            info!(agent_id = %self.settings.agent_id, "agent scheduling disabled");
            return;
        }
        let interval = Duration::from_secs(self.settings.scheduling_interval_secs.max(1));
        let warmup = Duration::from_secs(self.settings.warmup_delay_secs);
        info!(
            agent_id = %self.settings.agent_id,
            interval_secs = interval.as_secs(),
            warmup_secs = warmup.as_secs(),
            "agent control loop started"
        );

        let mut delay = warmup;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            delay = interval;

            match self.tick(&shutdown).await {
                Ok(report) => debug!(?report, "agent tick finished"),
                Err(AgentError::Interrupted) => {
                    info!("agent tick interrupted by shutdown");
                    break;
                }
                Err(e) => warn!(error = %e, "agent tick failed"),
            }
            if *shutdown.borrow() {
                break;
            }
        }
        info!(agent_id = %self.settings.agent_id, "agent control loop stopped");
    }

    /// Run all five protocol steps once.
    pub async fn tick(&mut self, shutdown: &watch::Receiver<bool>) -> Result<TickReport, AgentError> {
        let mut report = TickReport::default();
        let handle = self.handle();

        self.register_or_heartbeat(&handle, &mut report).await;

        if !self.engine.can_accept_jobs() {
            debug!("engine at capacity, not looking for jobs");
            report.engine_busy = true;
        } else {
            match self.client.list_job_requests(&handle, self.settings.reserved_jobs).await {
                Ok(requests) => {
                    report.pulled = requests.len();
                    for request in requests {
                        if !self.engine.can_accept_jobs() {
                            debug!(job_id = %request.job_id, "engine filled up, leaving remaining requests");
                            report.engine_busy = true;
                            break;
                        }
                        self.accept_and_submit(request, &mut report, shutdown).await?;
                    }
                }
                Err(e) => warn!(error = %e, "failed to list job requests"),
            }
        }

        self.report_jobs(&mut report).await;
        Ok(report)
    }

    // ── Steps ───────────────────────────────────────────────────────

    async fn register_or_heartbeat(&mut self, handle: &AgentHandle, report: &mut TickReport) {
        if self.registered {
            match self.client.send_heartbeat(handle).await {
                Ok(()) => {
                    report.heartbeat_sent = true;
                    return;
                }
                Err(ControlPlaneError::NotRegistered) => {
                    debug!(agent_id = %handle.agent_id, "heartbeat rejected, registering again");
                    self.registered = false;
                }
                Err(e) => {
                    warn!(error = %e, "failed to send heartbeat");
                    return;
                }
            }
        }
        match self.client.register_agent(handle).await {
            Ok(()) => {
                info!(agent_id = %handle.agent_id, controllers = ?handle.controller_names, "agent registered");
                self.registered = true;
                report.registered = true;
            }
            Err(e) => warn!(error = %e, "failed to register agent"),
        }
    }

    async fn accept_and_submit(
        &self,
        listed: JobRequest,
        report: &mut TickReport,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let agent_id = self.settings.agent_id.as_str();
        let tenant_id = listed.tenant_id.as_deref().or(self.settings.tenant_id.as_deref());

        let request = match self.client.accept_job_request(&listed.job_id, agent_id, tenant_id).await {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(job_id = %listed.job_id, "job request taken by another agent");
                report.already_claimed += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(job_id = %listed.job_id, error = %e, "failed to accept job request");
                return Ok(());
            }
        };
        report.accepted += 1;

        let job_id = request.job_id.clone();
        let tenant_id = request.tenant_id.clone().or_else(|| self.settings.tenant_id.clone());
        let reason = match self.engine.submit(request).await {
            Ok(()) => {
                report.submitted += 1;
                return Ok(());
            }
            Err(SubmitError::RateLimited) => {
                debug!(job_id = %job_id, "engine rate limited, handing job back");
                self.backoff(shutdown).await?;
                report.rejected_scheduled += 1;
                RejectReason::Scheduled
            }
            Err(SubmitError::Invalid(msg)) => {
                warn!(job_id = %job_id, reason = %msg, "rejecting invalid job request");
                report.rejected_invalid += 1;
                RejectReason::Invalid
            }
            Err(SubmitError::Internal(msg)) => {
                warn!(job_id = %job_id, error = %msg, "engine failed to take job, rejecting as invalid");
                report.rejected_invalid += 1;
                RejectReason::Invalid
            }
        };

        if let Err(e) = self
            .client
            .reject_job_request(&job_id, agent_id, reason, tenant_id.as_deref())
            .await
        {
            warn!(job_id = %job_id, status = %reason, error = %e, "failed to reject job request");
        }
        Ok(())
    }

    async fn report_jobs(&self, report: &mut TickReport) {
        let jobs = self.engine.jobs().await;
        if jobs.is_empty() {
            return;
        }
        let acks = match self
            .client
            .send_job_report(&jobs, self.settings.tenant_id.as_deref())
            .await
        {
            Ok(acks) => acks,
            Err(e) => {
                warn!(error = %e, jobs = jobs.len(), "failed to send job report");
                return;
            }
        };
        report.reported = jobs.len();

        if !self.settings.auto_clear_jobs {
            return;
        }
        let clearable: Vec<String> = jobs
            .iter()
            .filter(|job| job.done && acks.get(&job.job_id).copied().unwrap_or(false))
            .map(|job| job.job_id.clone())
            .collect();
        if clearable.is_empty() {
            return;
        }
        report.cleared = self.engine.clear_jobs(&clearable).await;
        debug!(cleared = report.cleared, "cleared acknowledged jobs");
    }

    /// Wait out the rate-limit pause unless shutdown arrives first.
    async fn backoff(&self, shutdown: &watch::Receiver<bool>) -> Result<(), AgentError> {
        let mut shutdown = shutdown.clone();
        if *shutdown.borrow() {
            return Err(AgentError::Interrupted);
        }
        let deadline = tokio::time::Instant::now() + Duration::from_millis(self.settings.rate_limit_backoff_ms);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Err(AgentError::Interrupted);
                    }
                }
            }
        }
    }
}
