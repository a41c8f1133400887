//! Observability registry for in-flight submissions to either pool, backing
//! `top`/`job_info` (spec §4.1).

use merge_worker_proto::PInfo;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

pub struct RunningJob {
    pub pinfo: PInfo,
    pub started_at: Instant,
}

#[derive(Default)]
pub struct JobRegistry {
    next_id: AtomicU64,
    running: Mutex<BTreeMap<u64, RunningJob>>,
}

/// A handle that removes its entry from the registry when dropped, so a
/// submission is tracked for exactly the lifetime of its future.
pub struct JobHandle<'a> {
    id: u64,
    registry: &'a JobRegistry,
}

impl Drop for JobHandle<'_> {
    fn drop(&mut self) {
        self.registry.running.lock().unwrap().remove(&self.id);
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, pinfo: PInfo) -> JobHandle<'_> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.running.lock().unwrap().insert(
            id,
            RunningJob {
                pinfo,
                started_at: Instant::now(),
            },
        );
        JobHandle { id, registry: self }
    }

    /// Snapshot of currently running submissions, ordered by id (submission
    /// order), for `top`/`job_info`.
    pub fn snapshot(&self) -> Vec<(u64, PInfo, std::time::Duration)> {
        self.running
            .lock()
            .unwrap()
            .iter()
            .map(|(id, job)| (*id, job.pinfo.clone(), job.started_at.elapsed()))
            .collect()
    }
}
