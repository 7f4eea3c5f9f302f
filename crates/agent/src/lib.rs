pub mod control_plane;
pub mod controllers;
pub mod engine;
pub mod error;
pub mod service;
pub mod types;

pub use control_plane::{ControlPlaneClient, HttpControlPlaneClient};
pub use controllers::HttpFetchController;
pub use engine::{Controller, IngestionEngine, LocalIngestionEngine};
pub use error::{AgentError, ControlPlaneError, ControllerError, SubmitError};
pub use service::{AgentControlService, TickReport};
pub use types::*;
