pub mod backend;
pub mod error;
pub mod memory;
pub mod payload;
pub mod postgres;
pub mod results;
pub mod store;

pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use error::{BlobError, StoreError};
pub use memory::{InMemoryJobStore, StoreStats};
pub use payload::ObjectStorePayloadStore;
pub use postgres::PgJobStore;
pub use results::ResultFileStore;
pub use store::{JobDefinitionStore, JobInstanceStore, JobStore, PayloadBlobStore};
