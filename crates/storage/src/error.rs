use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] sluice_core::SluiceError),

    #[error("duplicate job definition: {0}")]
    DuplicateDefinition(uuid::Uuid),

    #[error("job definition not found: {0}")]
    DefinitionNotFound(uuid::Uuid),

    #[error("definition update without a where clause")]
    UnscopedUpdate,

    #[error("{0}")]
    Other(String),
}

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}
