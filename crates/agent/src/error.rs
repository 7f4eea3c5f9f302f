use thiserror::Error;

/// Failures talking to the control plane.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    /// The control plane does not know this agent (HTTP 409 on heartbeat).
    #[error("agent is not registered with the control plane")]
    NotRegistered,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("base URL cannot carry a path: {0}")]
    InvalidBaseUrl(String),

    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Why the engine refused a job request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// Temporarily out of capacity or over the submission rate; retry later.
    #[error("engine is rate limited")]
    RateLimited,

    /// The request can never run here.
    #[error("invalid job request: {0}")]
    Invalid(String),

    #[error("internal engine error: {0}")]
    Internal(String),
}

/// A controller's ingestion run failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ControllerError(pub String);

impl ControllerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    /// Shutdown arrived while the tick was waiting out a rate-limit backoff.
    #[error("interrupted by shutdown")]
    Interrupted,

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}
