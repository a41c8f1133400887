//! Wire types shared between the Job Manager and the `merge-worker` sidecar
//! binary. Requests and responses cross a process boundary as a single
//! newline-delimited JSON object each, since (unlike the Python original
//! this was distilled from) Rust cannot ship a closure and its captured
//! arguments across a `fork`/`pickle` boundary -- only data crosses, and
//! `MergeBatchTask` is the only payload this hub ever ships to a worker.

use serde::{Deserialize, Serialize};

/// Observability descriptor recorded alongside a submission to either Job
/// Manager pool, surfaced via `top`/`job_info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PInfo {
    pub category: String,
    pub source: String,
    pub step: String,
    pub description: String,
}

impl PInfo {
    pub fn builder(build_name: &str, target_name: &str) -> Self {
        Self {
            category: "builder".to_string(),
            source: format!("{build_name}:{target_name}"),
            step: String::new(),
            description: String::new(),
        }
    }
}

/// A single merge batch: a bounded set of document ids to be read from
/// `source_collection`, transformed by `mapper`, and written to
/// `target_collection`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeBatchTask {
    pub source_db_uri: String,
    pub source_db_name: String,
    pub target_db_uri: String,
    pub target_db_name: String,
    pub source_collection: String,
    pub target_collection: String,
    pub ids: Vec<serde_json::Value>,
    pub mapper: String,
    pub upsert: bool,
    pub batch_num: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub task: MergeBatchTask,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome")]
pub enum WorkerResponse {
    /// The batch merged successfully; `merged_count` documents were
    /// written (counted as the original does: one count per input id
    /// whose mapper output was written, not per output document).
    Merged { batch_num: u64, merged_count: i64 },
    /// The batch failed; `dump_file` names the crash-dump written for
    /// post-mortem, per the spec's crash-dump contract.
    Failed {
        batch_num: u64,
        message: String,
        dump_file: String,
    },
}

impl WorkerResponse {
    pub fn batch_num(&self) -> u64 {
        match self {
            WorkerResponse::Merged { batch_num, .. } => *batch_num,
            WorkerResponse::Failed { batch_num, .. } => *batch_num,
        }
    }
}

/// Line the worker process prints to stdout once its store connections are
/// established and it is ready to accept `WorkerRequest` lines, mirroring
/// the `println!("READY")` convention used by this codebase's sidecar
/// worker binaries.
pub const WORKER_READY_LINE: &str = "READY";

/// The actual line a worker writes to stdout after `READY`: its merge
/// outcome plus its own resident set size, so the Job Manager can track
/// aggregate worker memory without introspecting the OS process itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub response: WorkerResponse,
    pub rss_bytes: u64,
}
