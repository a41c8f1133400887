//! The worker-process pool backing `defer_to_process`. See SPEC_FULL
//! §4.1.1: each worker is a long-lived `merge-worker` sidecar reachable
//! over newline-delimited JSON on its stdin/stdout.

use crate::error::JobManagerError;
use async_process::{Child, Command};
use merge_worker_proto::{MergeBatchTask, WorkerReply, WorkerRequest, WORKER_READY_LINE};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::mpsc;

struct WorkerHandle {
    id: usize,
    #[allow(dead_code)]
    child: Child,
    stdin: BufWriter<tokio::fs::File>,
    stdout: Lines<BufReader<tokio::fs::File>>,
}

async fn spawn_worker(worker_binary: &PathBuf, id: usize) -> Result<WorkerHandle, JobManagerError> {
    let mut command = Command::new(worker_binary);
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let std_child = command.spawn().map_err(JobManagerError::Spawn)?;
    let mut child: Child = std_child.into();
    child.kill_on_drop(true);

    let stdin = child.stdin.take().expect("worker spawned with piped stdin");
    let stdout = child
        .stdout
        .take()
        .expect("worker spawned with piped stdout");

    let mut stdout = BufReader::new(stdout).lines();
    let ready = stdout
        .next_line()
        .await
        .map_err(|e| JobManagerError::Protocol(id, e.to_string()))?;
    match ready.as_deref() {
        Some(WORKER_READY_LINE) => {}
        other => {
            return Err(JobManagerError::Protocol(
                id,
                format!("expected {WORKER_READY_LINE:?}, got {other:?}"),
            ))
        }
    }

    Ok(WorkerHandle {
        id,
        child,
        stdin: BufWriter::new(stdin),
        stdout,
    })
}

/// Tracks per-worker resident-set-size so `defer_to_process` can block
/// admission rather than exceed `max_memory_usage` (SPEC_FULL §4.1.1).
#[derive(Default)]
struct MemoryTracker {
    rss_by_worker: std::collections::HashMap<usize, u64>,
}

impl MemoryTracker {
    fn total(&self) -> u64 {
        self.rss_by_worker.values().sum()
    }

    fn record(&mut self, worker_id: usize, rss_bytes: u64) {
        self.rss_by_worker.insert(worker_id, rss_bytes);
    }

    fn forget(&mut self, worker_id: usize) {
        self.rss_by_worker.remove(&worker_id);
    }
}

pub struct WorkerPool {
    worker_binary: PathBuf,
    max_memory_usage: u64,
    idle_tx: mpsc::Sender<WorkerHandle>,
    idle_rx: tokio::sync::Mutex<mpsc::Receiver<WorkerHandle>>,
    memory: Mutex<MemoryTracker>,
    memory_notify: tokio::sync::Notify,
}

impl WorkerPool {
    pub async fn spawn(
        worker_binary: PathBuf,
        num_workers: usize,
        max_memory_usage: u64,
    ) -> Result<Self, JobManagerError> {
        let (idle_tx, idle_rx) = mpsc::channel(num_workers);
        let pool = Self {
            worker_binary,
            max_memory_usage,
            idle_tx,
            idle_rx: tokio::sync::Mutex::new(idle_rx),
            memory: Mutex::new(MemoryTracker::default()),
            memory_notify: tokio::sync::Notify::new(),
        };

        for id in 0..num_workers {
            let worker = spawn_worker(&pool.worker_binary, id).await?;
            pool.idle_tx
                .send(worker)
                .await
                .expect("idle channel has capacity for every spawned worker");
        }
        Ok(pool)
    }

    async fn wait_for_memory_headroom(&self) {
        loop {
            if self.memory.lock().unwrap().total() < self.max_memory_usage {
                return;
            }
            self.memory_notify.notified().await;
        }
    }

    /// Submit one merge batch to the least-recently-idle worker, blocking
    /// (never erroring) while aggregate worker memory is at or above
    /// `max_memory_usage`.
    pub async fn submit(&self, task: MergeBatchTask) -> Result<WorkerReply, JobManagerError> {
        self.wait_for_memory_headroom().await;

        let mut worker = {
            let mut rx = self.idle_rx.lock().await;
            rx.recv().await.expect("idle channel outlives the pool")
        };

        let batch_num = task.batch_num;
        let request = WorkerRequest { task };
        let line = serde_json::to_string(&request)
            .map_err(|e| JobManagerError::Protocol(worker.id, e.to_string()))?;

        let write_result: std::io::Result<()> = async {
            worker.stdin.write_all(line.as_bytes()).await?;
            worker.stdin.write_all(b"\n").await?;
            worker.stdin.flush().await
        }
        .await;

        if write_result.is_err() {
            self.retire_and_respawn(worker.id).await;
            return Err(JobManagerError::InfrastructureError {
                worker_id: worker.id,
                batch_num,
            });
        }

        let reply = match worker.stdout.next_line().await {
            Ok(Some(line)) => serde_json::from_str::<WorkerReply>(&line)
                .map_err(|e| JobManagerError::Protocol(worker.id, e.to_string())),
            Ok(None) | Err(_) => {
                let worker_id = worker.id;
                self.retire_and_respawn(worker_id).await;
                return Err(JobManagerError::InfrastructureError {
                    worker_id,
                    batch_num,
                });
            }
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                self.return_idle(worker).await;
                return Err(err);
            }
        };

        self.memory
            .lock()
            .unwrap()
            .record(worker.id, reply.rss_bytes);
        self.memory_notify.notify_waiters();

        self.return_idle(worker).await;
        Ok(reply)
    }

    async fn return_idle(&self, worker: WorkerHandle) {
        let _ = self.idle_tx.send(worker).await;
    }

    async fn retire_and_respawn(&self, worker_id: usize) {
        self.memory.lock().unwrap().forget(worker_id);
        self.memory_notify.notify_waiters();
        match spawn_worker(&self.worker_binary, worker_id).await {
            Ok(replacement) => {
                let _ = self.idle_tx.send(replacement).await;
            }
            Err(err) => {
                tracing::error!(worker_id, %err, "failed to respawn crashed worker");
            }
        }
    }
}
