#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("source '{0}' is not ready: no upload job with terminal status 'success'")]
    ResourceNotReady(String),

    #[error("build configuration error: {0}")]
    BuildConfigurationError(String),

    #[error("requested sources resolved to zero collections")]
    ResolutionEmpty,

    #[error("batch {batch_num} of source '{source}' failed: {message} (dump: {dump_file})")]
    BatchFailure {
        source: String,
        batch_num: u64,
        message: String,
        dump_file: String,
    },

    #[error("infrastructure error: {0}")]
    InfrastructureError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<store::StoreError> for BuilderError {
    fn from(err: store::StoreError) -> Self {
        BuilderError::InfrastructureError(err.to_string())
    }
}

impl From<job_manager::JobManagerError> for BuilderError {
    fn from(err: job_manager::JobManagerError) -> Self {
        BuilderError::InfrastructureError(err.to_string())
    }
}

impl From<mappers::MapperError> for BuilderError {
    fn from(err: mappers::MapperError) -> Self {
        BuilderError::BuildConfigurationError(err.to_string())
    }
}
