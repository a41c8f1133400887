//! The command surface the (out-of-scope) SSH/HTTP front ends dispatch
//! into, and the registry of in-flight invocations backing `top`/`job_info`
//! (SPEC_FULL §4.6). This crate runs no merge logic itself: every command
//! is a thin, typed wrapper around a `builder_manager::BuilderManager`
//! call, fired onto its own task so the caller gets a command id back
//! immediately rather than blocking for the whole merge.

mod error;

pub use error::CommandTableError;

use builder::BuildStats;
use builder_manager::BuilderManager;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use store::DocId;

/// Outcome of a finished command invocation, recorded once its task
/// completes.
#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Merged(BuildStats),
    Failed(String),
}

enum CommandState {
    Running,
    Finished(CommandOutcome),
}

struct CommandRecord {
    cmd: String,
    build_name: String,
    started_at: DateTime<Utc>,
    state: Arc<Mutex<CommandState>>,
}

/// A finished-or-running snapshot line, mirroring the original's
/// `"[%s] %s %s: finished %s"` / `"[%s] RUN {%s} %s"` job listing.
#[derive(Debug, Clone)]
pub struct CommandStatusLine {
    pub id: u64,
    pub cmd: String,
    pub running: bool,
    pub elapsed: std::time::Duration,
    pub outcome: Option<CommandOutcome>,
}

/// Tracks in-flight command invocations, keyed by an incrementing id, and
/// enforces the "one in-flight merge per build_name" singleton rule --
/// the direct analogue of `HubShell.running_commands` and its
/// `AlreadyRunningException`.
#[derive(Default)]
struct JobRegistry {
    next_id: u64,
    running: BTreeMap<u64, CommandRecord>,
}

impl JobRegistry {
    fn is_build_running(&self, build_name: &str) -> bool {
        self.running
            .values()
            .any(|r| r.build_name == build_name && matches!(*r.state.lock().unwrap(), CommandState::Running))
    }

    fn insert(&mut self, cmd: String, build_name: String, state: Arc<Mutex<CommandState>>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.running.insert(
            id,
            CommandRecord {
                cmd,
                build_name,
                started_at: Utc::now(),
                state,
            },
        );
        id
    }
}

pub struct CommandTable {
    builder_manager: Arc<BuilderManager>,
    registry: Mutex<JobRegistry>,
}

impl CommandTable {
    pub fn new(builder_manager: Arc<BuilderManager>) -> Self {
        Self {
            builder_manager,
            registry: Mutex::new(JobRegistry::default()),
        }
    }

    /// `merge(build_name, sources?, target_name?)`: the hub's primary
    /// command. Rejects a second concurrent invocation for the same
    /// `build_name` with `AlreadyRunning`, matching the original shell's
    /// poor man's singleton check (there it was keyed by the literal
    /// command line; here, by `build_name`, since that is what the
    /// underlying "one merge at a time" constraint actually guards).
    #[allow(clippy::too_many_arguments)]
    pub async fn merge(
        &self,
        build_name: &str,
        sources: Option<Vec<String>>,
        target_name: Option<String>,
        force: bool,
        ids: Option<Vec<DocId>>,
    ) -> Result<u64, CommandTableError> {
        {
            let registry = self.registry.lock().unwrap();
            if registry.is_build_running(build_name) {
                return Err(CommandTableError::AlreadyRunning(build_name.to_string()));
            }
        }

        let handle = self
            .builder_manager
            .merge(build_name, sources, target_name, force, ids)
            .await?;

        let state = Arc::new(Mutex::new(CommandState::Running));
        let cmd_desc = format!("merge({build_name})");
        let id = {
            let mut registry = self.registry.lock().unwrap();
            registry.insert(cmd_desc, build_name.to_string(), state.clone())
        };

        tokio::spawn(async move {
            let outcome = match handle.join().await {
                Ok(stats) => CommandOutcome::Merged(stats),
                Err(err) => CommandOutcome::Failed(err.to_string()),
            };
            *state.lock().unwrap() = CommandState::Finished(outcome);
        });

        Ok(id)
    }

    /// List persisted target collections for `build_name`, or every
    /// registered build if none given. Runs synchronously; it is a plain
    /// read, not a tracked command.
    pub async fn lsmerge(
        &self,
        build_name: Option<&str>,
    ) -> Result<Vec<(String, Vec<String>)>, CommandTableError> {
        Ok(self.builder_manager.lsmerge(build_name).await?)
    }

    /// Drop one target collection outright.
    pub async fn rmmerge(&self, target_name: &str) -> Result<(), CommandTableError> {
        Ok(self.builder_manager.rmmerge(target_name).await?)
    }

    /// Archive/clean temporary target collections for `build_name`.
    pub async fn archive(
        &self,
        build_name: &str,
        date: Option<&str>,
        prefix: &str,
    ) -> Result<(), CommandTableError> {
        self.builder_manager
            .clean_temp_collections(build_name, date, prefix)
            .await?;
        Ok(())
    }

    /// The build names currently flagged `pending_to_build`.
    pub async fn whatsnew(&self) -> Result<Vec<String>, CommandTableError> {
        Ok(self.builder_manager.whatsnew().await?)
    }

    /// `top`/`job_info`: a snapshot of every tracked command, running or
    /// finished, in id order. Finished entries are swept from the table
    /// after being reported once, matching the original's behavior of
    /// popping `running_commands` on the listing call that first observes
    /// completion.
    pub fn job_info(&self) -> Vec<CommandStatusLine> {
        let mut registry = self.registry.lock().unwrap();
        let mut lines = Vec::with_capacity(registry.running.len());
        let mut finished_ids = Vec::new();

        for (&id, record) in registry.running.iter() {
            let state = record.state.lock().unwrap();
            let elapsed = (Utc::now() - record.started_at)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            match &*state {
                CommandState::Running => lines.push(CommandStatusLine {
                    id,
                    cmd: record.cmd.clone(),
                    running: true,
                    elapsed,
                    outcome: None,
                }),
                CommandState::Finished(outcome) => {
                    lines.push(CommandStatusLine {
                        id,
                        cmd: record.cmd.clone(),
                        running: false,
                        elapsed,
                        outcome: Some(outcome.clone()),
                    });
                    finished_ids.push(id);
                }
            }
        }

        for id in finished_ids {
            registry.running.remove(&id);
        }

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reports_running_build_as_in_flight() {
        let mut registry = JobRegistry::default();
        assert!(!registry.is_build_running("flu"));
        registry.insert(
            "merge(flu)".to_string(),
            "flu".to_string(),
            Arc::new(Mutex::new(CommandState::Running)),
        );
        assert!(registry.is_build_running("flu"));
        assert!(!registry.is_build_running("other"));
    }

    #[test]
    fn finished_commands_do_not_block_a_new_invocation() {
        let mut registry = JobRegistry::default();
        let state = Arc::new(Mutex::new(CommandState::Finished(CommandOutcome::Merged(
            BuildStats::new(),
        ))));
        registry.insert("merge(flu)".to_string(), "flu".to_string(), state);
        assert!(!registry.is_build_running("flu"));
    }
}
