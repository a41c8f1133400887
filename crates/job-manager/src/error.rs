#[derive(Debug, thiserror::Error)]
pub enum JobManagerError {
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker {worker_id} crashed or closed its pipes while handling batch {batch_num}")]
    InfrastructureError { worker_id: usize, batch_num: u64 },

    #[error("worker {0} sent a malformed reply: {1}")]
    Protocol(usize, String),

    #[error("merge batch {batch_num} failed: {message}")]
    TaskFailed { batch_num: u64, message: String },
}
