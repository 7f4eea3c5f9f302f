//! Agent side of the control-plane job distribution protocol.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use sluice_core::config::ControlPlaneConfig;

use crate::error::ControlPlaneError;
use crate::types::{AgentHandle, IngestionJob, JobRequest, RejectReason};

#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn register_agent(&self, handle: &AgentHandle) -> Result<(), ControlPlaneError>;

    /// Fails with [`ControlPlaneError::NotRegistered`] when the control
    /// plane has no record of the agent.
    async fn send_heartbeat(&self, handle: &AgentHandle) -> Result<(), ControlPlaneError>;

    /// Pending requests for this agent. `reserved`: `None` = all,
    /// `Some(true)` = reserved only, `Some(false)` = non-reserved only.
    async fn list_job_requests(
        &self,
        handle: &AgentHandle,
        reserved: Option<bool>,
    ) -> Result<Vec<JobRequest>, ControlPlaneError>;

    /// Claim a request. `Ok(None)` when it was already claimed or is gone.
    async fn accept_job_request(
        &self,
        job_id: &str,
        agent_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<JobRequest>, ControlPlaneError>;

    async fn reject_job_request(
        &self,
        job_id: &str,
        agent_id: &str,
        reason: RejectReason,
        tenant_id: Option<&str>,
    ) -> Result<(), ControlPlaneError>;

    /// Returns, per job id, whether the control plane acknowledged it.
    async fn send_job_report(
        &self,
        jobs: &[IngestionJob],
        tenant_id: Option<&str>,
    ) -> Result<HashMap<String, bool>, ControlPlaneError>;
}

// ── Wire bodies ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JobRequestList {
    #[serde(default)]
    records: Vec<JobRequest>,
}

#[derive(Debug, Serialize)]
struct AcceptBody<'a> {
    agent_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct RejectBody<'a> {
    agent_id: &'a str,
    status: RejectReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct ReportBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_id: Option<&'a str>,
    jobs: &'a [IngestionJob],
}

#[derive(Debug, Deserialize)]
struct ReportAck {
    #[serde(default)]
    acknowledged: HashMap<String, bool>,
}

// ── HTTP client ─────────────────────────────────────────────────────

/// JSON-over-HTTP control-plane client.
#[derive(Debug, Clone)]
pub struct HttpControlPlaneClient {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpControlPlaneClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ControlPlaneError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(ControlPlaneError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, ControlPlaneError> {
        Self::new(&config.url, Duration::from_secs(config.request_timeout_secs.max(1)))
    }

    /// `{base}/control-plane/v1/{segments...}`, each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ControlPlaneError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ControlPlaneError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["control-plane", "v1"])
            .extend(segments);
        Ok(url)
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, ControlPlaneError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ControlPlaneError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn register_agent(&self, handle: &AgentHandle) -> Result<(), ControlPlaneError> {
        let url = self.endpoint(&["agents"])?;
        let resp = self.client.post(url).json(handle).send().await?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn send_heartbeat(&self, handle: &AgentHandle) -> Result<(), ControlPlaneError> {
        let url = self.endpoint(&["agents", &handle.agent_id, "heartbeat"])?;
        let resp = self.client.put(url).json(handle).send().await?;
        if resp.status() == StatusCode::CONFLICT {
            return Err(ControlPlaneError::NotRegistered);
        }
        ensure_success(resp).await?;
        Ok(())
    }

    async fn list_job_requests(
        &self,
        handle: &AgentHandle,
        reserved: Option<bool>,
    ) -> Result<Vec<JobRequest>, ControlPlaneError> {
        let mut url = self.endpoint(&["job-requests"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("agent_id", &handle.agent_id);
            if let Some(reserved) = reserved {
                query.append_pair("reserved", if reserved { "true" } else { "false" });
            }
            if let Some(tenant_id) = &handle.tenant_id {
                query.append_pair("tenant_id", tenant_id);
            }
            if !handle.integration_ids.is_empty() {
                query.append_pair("integration_ids", &handle.integration_ids.join(","));
            }
        }
        let resp = ensure_success(self.client.get(url).send().await?).await?;
        let list: JobRequestList = resp.json().await?;
        Ok(list.records)
    }

    async fn accept_job_request(
        &self,
        job_id: &str,
        agent_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Option<JobRequest>, ControlPlaneError> {
        let url = self.endpoint(&["job-requests", job_id, "accept"])?;
        let body = AcceptBody { agent_id, tenant_id };
        let resp = self.client.post(url).json(&body).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            debug!(job_id, "job request already claimed or gone");
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        Ok(Some(resp.json().await?))
    }

    async fn reject_job_request(
        &self,
        job_id: &str,
        agent_id: &str,
        reason: RejectReason,
        tenant_id: Option<&str>,
    ) -> Result<(), ControlPlaneError> {
        let url = self.endpoint(&["job-requests", job_id, "reject"])?;
        let body = RejectBody {
            agent_id,
            status: reason,
            tenant_id,
        };
        let resp = self.client.post(url).json(&body).send().await?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn send_job_report(
        &self,
        jobs: &[IngestionJob],
        tenant_id: Option<&str>,
    ) -> Result<HashMap<String, bool>, ControlPlaneError> {
        let url = self.endpoint(&["job-requests", "report"])?;
        let body = ReportBody { tenant_id, jobs };
        let resp = ensure_success(self.client.post(url).json(&body).send().await?).await?;
        let ack: ReportAck = resp.json().await?;
        Ok(ack.acknowledged)
    }
}
