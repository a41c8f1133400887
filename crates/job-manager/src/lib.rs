//! The two submission pools described in SPEC_FULL §4.1: a cooperative
//! in-process pool (`defer_to_thread`) and a worker-process pool
//! (`defer_to_process`), plus the observability registry backing
//! `top`/`job_info`.

mod error;
mod pinfo;
mod pool;

pub use error::JobManagerError;
pub use pinfo::{JobHandle, JobRegistry};

use merge_worker_proto::{MergeBatchTask, PInfo, WorkerReply};
use pool::WorkerPool;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub num_workers: usize,
    pub max_memory_usage: u64,
    pub worker_binary: PathBuf,
}

/// Owns both submission pools and the single registry both report into.
/// One `JobManager` is constructed per hub process and shared by every
/// Builder.
pub struct JobManager {
    registry: Arc<JobRegistry>,
    pool: WorkerPool,
    thread_semaphore: Arc<Semaphore>,
}

impl JobManager {
    pub async fn new(config: JobManagerConfig) -> Result<Self, JobManagerError> {
        let pool = WorkerPool::spawn(
            config.worker_binary.clone(),
            config.num_workers,
            config.max_memory_usage,
        )
        .await?;

        Ok(Self {
            registry: Arc::new(JobRegistry::new()),
            pool,
            thread_semaphore: Arc::new(Semaphore::new(config.num_workers)),
        })
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Submit one merge batch to the worker-process pool. Blocks while
    /// admitting it would exceed the configured memory ceiling; never
    /// drops a submission.
    #[tracing::instrument(skip(self, task), fields(batch_num = task.batch_num))]
    pub async fn defer_to_process(
        &self,
        pinfo: PInfo,
        task: MergeBatchTask,
    ) -> Result<WorkerReply, JobManagerError> {
        let _job = self.registry.track(pinfo);
        self.pool.submit(task).await
    }

    /// Run `fut` as a cooperative in-process task, gated by a semaphore
    /// sized to the same `num_workers` budget as the process pool (SPEC_FULL
    /// §4.1.1), matching the acquire-spawn-release shape this codebase uses
    /// for its own dequeue loop.
    pub async fn defer_to_thread<F, T>(&self, pinfo: PInfo, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self
            .thread_semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("thread semaphore is never closed");
        let registry = self.registry.clone();

        let handle = tokio::spawn(async move {
            let _job = registry.track(pinfo);
            let result = fut.await;
            drop(permit);
            result
        });

        handle.await.expect("deferred task does not panic")
    }
}
