use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::config::AgentSettings;

/// Identity and capabilities an agent announces on register and heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHandle {
    pub agent_id: String,
    pub agent_type: String,
    pub version: String,
    /// Set for dedicated agents that only serve one tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub integration_ids: Vec<String>,
    /// Names of the controllers this agent can run.
    pub controller_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<AgentTelemetry>,
}

impl AgentHandle {
    pub fn from_settings(settings: &AgentSettings, controller_names: Vec<String>) -> Self {
        Self {
            agent_id: settings.agent_id.clone(),
            agent_type: settings.agent_type.clone(),
            version: settings.version.clone(),
            tenant_id: settings.tenant_id.clone(),
            integration_ids: settings.integration_ids.clone(),
            controller_names,
            telemetry: None,
        }
    }

    pub fn with_telemetry(mut self, telemetry: AgentTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTelemetry {
    pub running_jobs: usize,
    pub max_concurrent_jobs: usize,
    pub uptime_secs: u64,
}

/// A fetch job offered by the control plane.
///
/// Listing returns only `job_id` and `controller_name`; the rest arrives
/// with a successful accept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: String,
    pub controller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
    /// Controller-specific parameters.
    #[serde(default)]
    pub query: serde_json::Value,
    #[serde(default)]
    pub reserved: bool,
}

impl JobRequest {
    pub fn new(job_id: impl Into<String>, controller_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            controller_name: controller_name.into(),
            tenant_id: None,
            integration_id: None,
            query: serde_json::Value::Null,
            reserved: false,
        }
    }
}

/// Status a rejected request is handed back with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Put back in the queue for another attempt.
    Scheduled,
    /// Never retried.
    Invalid,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => f.write_str("scheduled"),
            Self::Invalid => f.write_str("invalid"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionJobStatus {
    Running,
    Success,
    Failure,
    Canceled,
}

impl IngestionJobStatus {
    pub fn is_done(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Local view of a job the engine has taken on. Sent in job reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionJob {
    pub job_id: String,
    pub controller_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_id: Option<String>,
    pub status: IngestionJobStatus,
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IngestionJob {
    pub fn running(request: &JobRequest) -> Self {
        let now = Utc::now();
        Self {
            job_id: request.job_id.clone(),
            controller_name: request.controller_name.clone(),
            tenant_id: request.tenant_id.clone(),
            integration_id: request.integration_id.clone(),
            status: IngestionJobStatus::Running,
            done: false,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn finish(&mut self, status: IngestionJobStatus) {
        self.status = status;
        self.done = status.is_done();
        self.updated_at = Utc::now();
    }
}
