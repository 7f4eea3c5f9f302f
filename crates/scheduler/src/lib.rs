pub mod error;
pub mod runner;
pub mod source;
pub mod supplier;
pub mod sync;

pub use error::SyncError;
pub use runner::SyncRunner;
pub use source::{HttpTriggerSource, StaticTriggerSource, TriggerSource};
pub use supplier::{JobParameterSupplier, StaticParameterSupplier, SupplierRegistry};
pub use sync::{Eligibility, SyncReport, TriggerSynchronizer, Whitelists};
