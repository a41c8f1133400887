#[derive(Debug, thiserror::Error)]
pub enum BuilderManagerError {
    #[error("no such builder for '{0}'")]
    UnknownBuild(String),

    #[error("poll_schedule is not defined")]
    NoPollSchedule,

    #[error("invalid cron schedule '{schedule}': {source}")]
    InvalidSchedule {
        schedule: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Builder(#[from] builder::BuilderError),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
