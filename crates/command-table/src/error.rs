#[derive(Debug, thiserror::Error)]
pub enum CommandTableError {
    #[error("command '{0}' is already running")]
    AlreadyRunning(String),

    #[error("no such running command id {0}")]
    UnknownCommandId(u64),

    #[error(transparent)]
    BuilderManager(#[from] builder_manager::BuilderManagerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
