use thiserror::Error;

use sluice_storage::StoreError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("control plane base URL cannot carry a path: {0}")]
    InvalidBaseUrl(String),

    #[error("control plane returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("trigger listing still had records after {0} pages")]
    TooManyPages(u32),
}
