#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document store connectivity error: {0}")]
    Connectivity(#[from] mongodb::error::Error),

    #[error("build configuration '{0}' was not found")]
    BuildConfigNotFound(String),

    #[error("source master document '{0}' was not found")]
    SourceMasterNotFound(String),

    #[error("malformed document: {0}")]
    Malformed(String),
}
