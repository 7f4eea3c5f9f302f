use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use sluice_agent::{
    AgentControlService, AgentError, AgentHandle, ControlPlaneClient, ControlPlaneError, IngestionEngine,
    IngestionJob, IngestionJobStatus, JobRequest, RejectReason, SubmitError,
};
use sluice_core::config::AgentSettings;

// ── Fakes ───────────────────────────────────────────────────────────

#[derive(Default)]
struct PlaneState {
    register_calls: usize,
    heartbeat_calls: usize,
    /// Next heartbeat answers 409.
    forget_agent: bool,
    list_calls: Vec<Option<bool>>,
    list_fails: bool,
    pending: Vec<JobRequest>,
    /// Ids another agent already claimed.
    claimed_elsewhere: HashSet<String>,
    accepted: Vec<String>,
    rejections: Vec<(String, RejectReason)>,
    reject_fails: bool,
    reports: Vec<Vec<String>>,
    acks: HashMap<String, bool>,
}

#[derive(Default)]
struct FakeControlPlane {
    state: Mutex<PlaneState>,
}

impl FakeControlPlane {
    fn with<R>(&self, f: impl FnOnce(&mut PlaneState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl ControlPlaneClient for FakeControlPlane {
    async fn register_agent(&self, _handle: &AgentHandle) -> Result<(), ControlPlaneError> {
        self.with(|s| s.register_calls += 1);
        Ok(())
    }

    async fn send_heartbeat(&self, _handle: &AgentHandle) -> Result<(), ControlPlaneError> {
        self.with(|s| {
            s.heartbeat_calls += 1;
            if std::mem::take(&mut s.forget_agent) {
                Err(ControlPlaneError::NotRegistered)
            } else {
                Ok(())
            }
        })
    }

    async fn list_job_requests(
        &self,
        _handle: &AgentHandle,
        reserved: Option<bool>,
    ) -> Result<Vec<JobRequest>, ControlPlaneError> {
        self.with(|s| {
            s.list_calls.push(reserved);
            if s.list_fails {
                return Err(ControlPlaneError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(s.pending
                .iter()
                .map(|r| JobRequest::new(r.job_id.clone(), r.controller_name.clone()))
                .collect())
        })
    }

    async fn accept_job_request(
        &self,
        job_id: &str,
        _agent_id: &str,
        _tenant_id: Option<&str>,
    ) -> Result<Option<JobRequest>, ControlPlaneError> {
        self.with(|s| {
            if s.claimed_elsewhere.contains(job_id) {
                return Ok(None);
            }
            s.accepted.push(job_id.to_string());
            Ok(s.pending.iter().find(|r| r.job_id == job_id).cloned())
        })
    }

    async fn reject_job_request(
        &self,
        job_id: &str,
        _agent_id: &str,
        reason: RejectReason,
        _tenant_id: Option<&str>,
    ) -> Result<(), ControlPlaneError> {
        self.with(|s| {
            s.rejections.push((job_id.to_string(), reason));
            if s.reject_fails {
                Err(ControlPlaneError::Status {
                    status: 500,
                    body: "boom".into(),
                })
            } else {
                Ok(())
            }
        })
    }

    async fn send_job_report(
        &self,
        jobs: &[IngestionJob],
        _tenant_id: Option<&str>,
    ) -> Result<HashMap<String, bool>, ControlPlaneError> {
        self.with(|s| {
            s.reports.push(jobs.iter().map(|j| j.job_id.clone()).collect());
            Ok(s.acks.clone())
        })
    }
}

#[derive(Default)]
struct FakeEngine {
    busy: AtomicBool,
    /// Engine reports busy once this many jobs were submitted.
    capacity: Mutex<Option<usize>>,
    outcomes: Mutex<VecDeque<Result<(), SubmitError>>>,
    submitted: Mutex<Vec<String>>,
    jobs: Mutex<Vec<IngestionJob>>,
}

impl FakeEngine {
    fn script(&self, outcome: Result<(), SubmitError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    fn add_job(&self, id: &str, status: IngestionJobStatus) {
        let mut job = IngestionJob::running(&JobRequest::new(id, "jira"));
        if status.is_done() {
            job.finish(status);
        }
        self.jobs.lock().unwrap().push(job);
    }

    fn job_ids(&self) -> Vec<String> {
        self.jobs.lock().unwrap().iter().map(|j| j.job_id.clone()).collect()
    }
}

#[async_trait]
impl IngestionEngine for FakeEngine {
    fn controller_names(&self) -> Vec<String> {
        vec!["jira".to_string()]
    }

    fn can_accept_jobs(&self) -> bool {
        !self.busy.load(Ordering::SeqCst)
    }

    fn running_jobs(&self) -> usize {
        0
    }

    fn max_concurrent_jobs(&self) -> usize {
        1
    }

    async fn submit(&self, request: JobRequest) -> Result<(), SubmitError> {
        let mut submitted = self.submitted.lock().unwrap();
        submitted.push(request.job_id.clone());
        if self.capacity.lock().unwrap().is_some_and(|cap| submitted.len() >= cap) {
            self.busy.store(true, Ordering::SeqCst);
        }
        drop(submitted);
        self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn jobs(&self) -> Vec<IngestionJob> {
        self.jobs.lock().unwrap().clone()
    }

    async fn clear_jobs(&self, job_ids: &[String]) -> usize {
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| !(j.done && job_ids.contains(&j.job_id)));
        before - jobs.len()
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn settings() -> AgentSettings {
    AgentSettings {
        agent_id: "agent-1".into(),
        warmup_delay_secs: 0,
        rate_limit_backoff_ms: 10,
        ..Default::default()
    }
}

fn service(
    plane: &Arc<FakeControlPlane>,
    engine: &Arc<FakeEngine>,
    settings: AgentSettings,
) -> AgentControlService {
    AgentControlService::new(plane.clone(), engine.clone(), settings)
}

fn pending(plane: &FakeControlPlane, ids: &[&str]) {
    plane.with(|s| {
        s.pending = ids.iter().map(|id| JobRequest::new(*id, "jira")).collect();
    });
}

// ── Registration ────────────────────────────────────────────────────

#[tokio::test]
async fn first_tick_registers_then_heartbeats() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let first = svc.tick(&rx).await.unwrap();
    assert!(first.registered);
    assert!(!first.heartbeat_sent);

    let second = svc.tick(&rx).await.unwrap();
    assert!(!second.registered);
    assert!(second.heartbeat_sent);

    plane.with(|s| {
        assert_eq!(s.register_calls, 1);
        assert_eq!(s.heartbeat_calls, 1);
    });
}

#[tokio::test]
async fn rejected_heartbeat_falls_back_to_registration() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    svc.tick(&rx).await.unwrap();
    plane.with(|s| s.forget_agent = true);

    let report = svc.tick(&rx).await.unwrap();
    assert!(report.registered);
    assert!(!report.heartbeat_sent);
    assert!(svc.is_registered());
    plane.with(|s| assert_eq!(s.register_calls, 2));
}

// ── Find / accept / submit ──────────────────────────────────────────

#[tokio::test]
async fn busy_engine_skips_finding_jobs() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    engine.busy.store(true, Ordering::SeqCst);
    pending(&plane, &["j1"]);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert!(report.engine_busy);
    assert_eq!(report.pulled, 0);
    plane.with(|s| assert!(s.list_calls.is_empty()));
    assert!(engine.submitted().is_empty());
}

#[tokio::test]
async fn reserved_filter_is_passed_through() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    let mut svc = service(
        &plane,
        &engine,
        AgentSettings {
            reserved_jobs: Some(true),
            ..settings()
        },
    );
    let (_tx, rx) = watch::channel(false);

    svc.tick(&rx).await.unwrap();
    plane.with(|s| assert_eq!(s.list_calls, [Some(true)]));
}

#[tokio::test]
async fn accepted_jobs_are_submitted() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    pending(&plane, &["j1", "j2"]);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.pulled, 2);
    assert_eq!(report.accepted, 2);
    assert_eq!(report.submitted, 2);
    assert_eq!(engine.submitted(), ["j1", "j2"]);
    plane.with(|s| assert!(s.rejections.is_empty()));
}

#[tokio::test]
async fn engine_filling_up_stops_accepting_the_rest() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    *engine.capacity.lock().unwrap() = Some(1);
    pending(&plane, &["j1", "j2", "j3"]);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.pulled, 3);
    assert_eq!(report.accepted, 1);
    assert_eq!(report.submitted, 1);
    assert!(report.engine_busy);
    assert_eq!(engine.submitted(), ["j1"]);
    plane.with(|s| {
        assert_eq!(s.accepted, ["j1"]);
        assert!(s.rejections.is_empty());
    });
}

#[tokio::test]
async fn job_claimed_elsewhere_is_skipped_silently() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    pending(&plane, &["j1", "j2"]);
    plane.with(|s| {
        s.claimed_elsewhere.insert("j1".into());
    });
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.already_claimed, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(engine.submitted(), ["j2"]);
    plane.with(|s| assert!(s.rejections.is_empty()));
}

#[tokio::test]
async fn rate_limited_job_is_handed_back_as_scheduled() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    engine.script(Err(SubmitError::RateLimited));
    pending(&plane, &["j1"]);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.rejected_scheduled, 1);
    assert_eq!(report.submitted, 0);
    plane.with(|s| assert_eq!(s.rejections, [("j1".to_string(), RejectReason::Scheduled)]));
}

#[tokio::test]
async fn invalid_and_internal_failures_reject_as_invalid() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    engine.script(Err(SubmitError::Invalid("bad query".into())));
    engine.script(Err(SubmitError::Internal("oops".into())));
    pending(&plane, &["j1", "j2"]);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.rejected_invalid, 2);
    plane.with(|s| {
        assert_eq!(
            s.rejections,
            [
                ("j1".to_string(), RejectReason::Invalid),
                ("j2".to_string(), RejectReason::Invalid),
            ]
        )
    });
}

#[tokio::test]
async fn failed_rejection_does_not_fail_the_tick() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    engine.script(Err(SubmitError::Invalid("bad".into())));
    pending(&plane, &["j1", "j2"]);
    plane.with(|s| s.reject_fails = true);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.rejected_invalid, 1);
    assert_eq!(report.submitted, 1);
}

#[tokio::test]
async fn list_failure_still_reports_jobs() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    engine.add_job("old", IngestionJobStatus::Running);
    plane.with(|s| s.list_fails = true);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.pulled, 0);
    assert_eq!(report.reported, 1);
}

#[tokio::test]
async fn shutdown_during_backoff_interrupts_the_tick() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    engine.script(Err(SubmitError::RateLimited));
    pending(&plane, &["j1"]);
    let mut svc = service(
        &plane,
        &engine,
        AgentSettings {
            rate_limit_backoff_ms: 60_000,
            ..settings()
        },
    );
    let (tx, rx) = watch::channel(false);

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(true);
        // Keep the sender alive until the tick has seen the change.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let result = tokio::time::timeout(Duration::from_secs(5), svc.tick(&rx))
        .await
        .expect("tick did not observe shutdown");
    assert!(matches!(result, Err(AgentError::Interrupted)));
    plane.with(|s| assert!(s.rejections.is_empty()));
}

// ── Report / auto-clear ─────────────────────────────────────────────

fn engine_with_mixed_jobs() -> Arc<FakeEngine> {
    let engine = Arc::new(FakeEngine::default());
    engine.add_job("done-acked", IngestionJobStatus::Success);
    engine.add_job("running-acked", IngestionJobStatus::Running);
    engine.add_job("done-unacked", IngestionJobStatus::Failure);
    engine
}

fn ack_all_but_unacked(plane: &FakeControlPlane) {
    plane.with(|s| {
        s.acks = HashMap::from([
            ("done-acked".to_string(), true),
            ("running-acked".to_string(), true),
            ("done-unacked".to_string(), false),
        ]);
    });
}

#[tokio::test]
async fn auto_clear_removes_only_finished_acknowledged_jobs() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = engine_with_mixed_jobs();
    ack_all_but_unacked(&plane);
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.reported, 3);
    assert_eq!(report.cleared, 1);
    assert_eq!(engine.job_ids(), ["running-acked", "done-unacked"]);
}

#[tokio::test]
async fn without_auto_clear_nothing_is_removed() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = engine_with_mixed_jobs();
    ack_all_but_unacked(&plane);
    let mut svc = service(
        &plane,
        &engine,
        AgentSettings {
            auto_clear_jobs: false,
            ..settings()
        },
    );
    let (_tx, rx) = watch::channel(false);

    let report = svc.tick(&rx).await.unwrap();
    assert_eq!(report.cleared, 0);
    assert_eq!(engine.job_ids().len(), 3);
}

#[tokio::test]
async fn no_local_jobs_means_no_report() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    let mut svc = service(&plane, &engine, settings());
    let (_tx, rx) = watch::channel(false);

    svc.tick(&rx).await.unwrap();
    plane.with(|s| assert!(s.reports.is_empty()));
}

// ── Loop ────────────────────────────────────────────────────────────

#[tokio::test]
async fn run_ticks_until_shutdown() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    let mut svc = service(
        &plane,
        &engine,
        AgentSettings {
            scheduling_interval_secs: 3600,
            ..settings()
        },
    );
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { svc.run(rx).await });

    for _ in 0..100 {
        if plane.with(|s| s.register_calls) > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(plane.with(|s| s.register_calls), 1);

    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("loop did not stop")
        .unwrap();
}

#[tokio::test]
async fn disabled_scheduling_never_ticks() {
    let plane = Arc::new(FakeControlPlane::default());
    let engine = Arc::new(FakeEngine::default());
    let mut svc = service(
        &plane,
        &engine,
        AgentSettings {
            scheduling_enabled: false,
            ..settings()
        },
    );
    let (_tx, rx) = watch::channel(false);

    svc.run(rx).await;
    assert_eq!(plane.with(|s| s.register_calls), 0);
}
