pub mod config;
pub mod error;
pub mod job;
pub mod progress;
pub mod trigger;

pub use config::Config;
pub use error::*;
pub use job::*;
pub use progress::*;
pub use trigger::*;
