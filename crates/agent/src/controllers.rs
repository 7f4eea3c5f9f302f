use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::engine::Controller;
use crate::error::ControllerError;
use crate::types::JobRequest;

/// Fetches one JSON document from `query.url` and returns it as the job result.
#[derive(Debug, Clone)]
pub struct HttpFetchController {
    client: reqwest::Client,
}

impl HttpFetchController {
    pub const NAME: &'static str = "http_fetch";

    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    fn target(request: &JobRequest) -> Result<Url, String> {
        let raw = request
            .query
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "query.url is required".to_string())?;
        let url = Url::parse(raw).map_err(|e| format!("query.url is not a valid URL: {e}"))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(format!("unsupported scheme `{other}`")),
        }
    }
}

#[async_trait]
impl Controller for HttpFetchController {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn validate(&self, request: &JobRequest) -> Result<(), String> {
        Self::target(request).map(|_| ())
    }

    async fn ingest(&self, request: &JobRequest) -> Result<Option<serde_json::Value>, ControllerError> {
        let url = Self::target(request).map_err(ControllerError)?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ControllerError::new(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ControllerError::new(format!("fetch returned {status}")));
        }
        let body = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| ControllerError::new(e.to_string()))?;
        Ok(Some(body))
    }
}
