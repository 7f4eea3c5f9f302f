//! Where ingestion triggers come from.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use sluice_core::config::ControlPlaneConfig;
use sluice_core::IngestionTrigger;

use crate::error::SyncError;

/// Hard stop for runaway pagination.
const DEFAULT_MAX_PAGES: u32 = 10_000;

#[async_trait]
pub trait TriggerSource: Send + Sync {
    /// Every trigger currently known, across all tenants.
    async fn fetch_triggers(&self) -> Result<Vec<IngestionTrigger>, SyncError>;
}

/// Fixed trigger list, for tests and one-off runs.
#[derive(Debug, Clone, Default)]
pub struct StaticTriggerSource {
    triggers: Vec<IngestionTrigger>,
}

impl StaticTriggerSource {
    pub fn new(triggers: Vec<IngestionTrigger>) -> Self {
        Self { triggers }
    }
}

#[async_trait]
impl TriggerSource for StaticTriggerSource {
    async fn fetch_triggers(&self) -> Result<Vec<IngestionTrigger>, SyncError> {
        Ok(self.triggers.clone())
    }
}

// ── HTTP ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TriggerPage {
    response: TriggerRecords,
}

#[derive(Debug, Deserialize)]
struct TriggerRecords {
    #[serde(default)]
    records: Vec<TriggerRecord>,
}

#[derive(Debug, Deserialize)]
struct TriggerRecord {
    id: String,
    tenant_id: String,
    integration_id: String,
    #[serde(rename = "type")]
    trigger_type: String,
    #[serde(default)]
    frequency: i32,
}

impl From<TriggerRecord> for IngestionTrigger {
    fn from(r: TriggerRecord) -> Self {
        Self {
            trigger_id: r.id,
            tenant_id: r.tenant_id,
            integration_id: r.integration_id,
            trigger_type: r.trigger_type.as_str().into(),
            frequency: r.frequency,
        }
    }
}

/// Reads triggers from the control plane, one page at a time, until a
/// page comes back empty.
#[derive(Debug, Clone)]
pub struct HttpTriggerSource {
    base_url: Url,
    client: reqwest::Client,
    max_pages: u32,
}

impl HttpTriggerSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url)?;
        if base_url.cannot_be_a_base() {
            return Err(SyncError::InvalidBaseUrl(base_url.to_string()));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url,
            client,
            max_pages: DEFAULT_MAX_PAGES,
        })
    }

    /// Fail instead of returning a partial list past this many pages.
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn from_config(config: &ControlPlaneConfig) -> Result<Self, SyncError> {
        Self::new(&config.url, Duration::from_secs(config.request_timeout_secs.max(1)))
    }

    /// `{base}/control-plane/v1/triggers`, keeping any base path.
    fn triggers_url(&self) -> Result<Url, SyncError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["control-plane", "v1", "triggers"]);
        Ok(url)
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<IngestionTrigger>, SyncError> {
        let mut url = self.triggers_url()?;
        url.query_pairs_mut().append_pair("page", &page.to_string());

        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SyncError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let page: TriggerPage = resp.json().await?;
        Ok(page.response.records.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl TriggerSource for HttpTriggerSource {
    async fn fetch_triggers(&self) -> Result<Vec<IngestionTrigger>, SyncError> {
        let mut all = Vec::new();
        for page in 0..self.max_pages {
            let records = self.fetch_page(page).await?;
            if records.is_empty() {
                return Ok(all);
            }
            debug!(page, count = records.len(), "fetched trigger page");
            all.extend(records);
        }
        // A truncated list would deactivate every definition past the cap.
        Err(SyncError::TooManyPages(self.max_pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_maps_to_trigger() {
        let raw = r#"{"response":{"records":[
            {"id":"t1","tenant_id":"acme","integration_id":"7","type":"Jira","frequency":30}
        ]}}"#;
        let page: TriggerPage = serde_json::from_str(raw).unwrap();
        let triggers: Vec<IngestionTrigger> = page.response.records.into_iter().map(Into::into).collect();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].trigger_id, "t1");
        assert_eq!(triggers[0].trigger_type.as_str(), "jira");
        assert_eq!(triggers[0].frequency, 30);
    }

    #[test]
    fn missing_records_is_an_empty_page() {
        let page: TriggerPage = serde_json::from_str(r#"{"response":{}}"#).unwrap();
        assert!(page.response.records.is_empty());
    }

    #[test]
    fn rejects_bad_base_url() {
        assert!(HttpTriggerSource::new("not a url", Duration::from_secs(1)).is_err());
        assert!(matches!(
            HttpTriggerSource::new("mailto:ops@example.com", Duration::from_secs(1)),
            Err(SyncError::InvalidBaseUrl(_))
        ));
    }

    #[test]
    fn triggers_url_keeps_base_path() {
        let timeout = Duration::from_secs(1);
        for base in ["https://cp.example.com/api", "https://cp.example.com/api/"] {
            let source = HttpTriggerSource::new(base, timeout).unwrap();
            assert_eq!(
                source.triggers_url().unwrap().as_str(),
                "https://cp.example.com/api/control-plane/v1/triggers"
            );
        }
        let bare = HttpTriggerSource::new("https://cp.example.com", timeout).unwrap();
        assert_eq!(
            bare.triggers_url().unwrap().as_str(),
            "https://cp.example.com/control-plane/v1/triggers"
        );
    }
}
