use thiserror::Error;

#[derive(Error, Debug)]
pub enum SluiceError {
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid job type: {0}")]
    InvalidJobType(String),

    #[error("Invalid whitelist entry: {0}")]
    InvalidWhitelistEntry(String),

    #[error("Job instance not found: {0}")]
    InstanceNotFound(String),

    #[error("{0}")]
    Other(String),
}
