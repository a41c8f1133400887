use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Building,
    Success,
    Failed,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStep {
    Init,
    MergeRoot,
    MergeOthers,
    Finalizing,
    PostMerge,
}

/// One entry in a `BuildConfig.build` history, appended at merge start and
/// updated in place as the merge progresses through its steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildHistoryEntry {
    pub status: BuildStatus,
    pub started_at: DateTime<Utc>,
    pub step_started_at: DateTime<Utc>,
    pub step: BuildStep,

    #[serde(default)]
    pub sources: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,

    /// Human-readable elapsed time, populated only on terminal transitions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_s: Option<f64>,

    pub logfile: String,
    pub target_backend: String,
    pub target_name: String,

    #[serde(default)]
    pub stats: BTreeMap<String, i64>,

    #[serde(default)]
    pub src_version: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl BuildHistoryEntry {
    pub fn transient(
        step: BuildStep,
        sources: Vec<String>,
        started_at: DateTime<Utc>,
        logfile: String,
        target_backend: String,
        target_name: String,
        pid: u32,
    ) -> Self {
        Self {
            status: BuildStatus::Building,
            started_at,
            step_started_at: Utc::now(),
            step,
            sources,
            pid: Some(pid),
            time: None,
            time_in_s: None,
            logfile,
            target_backend,
            target_name,
            stats: BTreeMap::new(),
            src_version: BTreeMap::new(),
            err: None,
        }
    }
}
