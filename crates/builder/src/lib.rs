//! The merge engine proper (SPEC_FULL §4.2): resolves sources, classifies
//! root vs non-root, fans out batches across the Job Manager's two pools,
//! records build history, and runs post-merge. This crate never talks to
//! `mongodb` directly -- only to the `SourceBackend`/`TargetBackend`
//! trait objects handed to it at construction.

mod error;
mod sources;

pub use error::BuilderError;
pub use sources::{get_mapper_for_source, get_root_document_sources, resolve_sources};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use job_manager::JobManager;
use merge_worker_proto::{MergeBatchTask, PInfo, WorkerResponse};
use models::{BuildHistoryEntry, BuildStatus, BuildStep};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use store::{DocId, SourceBackend, StoreError, TargetBackend};

/// Default merge batch size, per SPEC_FULL §6.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;
pub const DEFAULT_MAX_BUILD_STATUS: usize = 10;
pub const DEFAULT_KEEP_ARCHIVE: usize = 10;

/// Per-source merged-document counts, the Builder's `stats` output.
pub type BuildStats = BTreeMap<String, i64>;

#[derive(Debug, Clone)]
pub struct BuilderConfig {
    pub batch_size: usize,
    pub max_build_status: usize,
    pub keep_archive: usize,
    pub log_folder: String,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            max_build_status: DEFAULT_MAX_BUILD_STATUS,
            keep_archive: DEFAULT_KEEP_ARCHIVE,
            log_folder: "logs/build".to_string(),
        }
    }
}

/// A single named build's merge engine, bound to one source and one target
/// backend. Cheap to clone: every field is an `Arc`, so a spawned merge
/// task can own its copy independently of the `Builder` the caller holds.
#[derive(Clone)]
pub struct Builder {
    build_name: Arc<str>,
    source_backend: Arc<dyn SourceBackend>,
    target_backend: Arc<dyn TargetBackend>,
    job_manager: Arc<JobManager>,
    config: Arc<BuilderConfig>,
}

/// A pending merge, resolving when the whole merge -- root sources, other
/// sources, finalize, post-merge, and the terminal history write -- has
/// completed.
pub struct MergeHandle(tokio::task::JoinHandle<Result<BuildStats, BuilderError>>);

impl MergeHandle {
    pub async fn join(self) -> Result<BuildStats, BuilderError> {
        match self.0.await {
            Ok(result) => result,
            Err(join_err) => Err(BuilderError::InfrastructureError(join_err.to_string())),
        }
    }
}

impl Builder {
    pub fn new(
        build_name: impl Into<Arc<str>>,
        source_backend: Arc<dyn SourceBackend>,
        target_backend: Arc<dyn TargetBackend>,
        job_manager: Arc<JobManager>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            build_name: build_name.into(),
            source_backend,
            target_backend,
            job_manager,
            config: Arc::new(config),
        }
    }

    pub fn build_name(&self) -> &str {
        &self.build_name
    }

    /// Every configured source must have a master record and an upload job
    /// whose last recorded status is `success` (SPEC_FULL §4.2).
    async fn check_ready(&self) -> Result<(), BuilderError> {
        let build_config = self
            .source_backend
            .get_build_configuration(&self.build_name)
            .await?;
        for src_name in &build_config.sources {
            if !self.source_backend.is_source_ready(src_name).await? {
                return Err(BuilderError::ResourceNotReady(src_name.clone()));
            }
        }
        Ok(())
    }

    /// `merge(sources?, target_name?, force?, ids?)`, SPEC_FULL §4.2. Kicks
    /// off the merge on its own Tokio task and returns a handle to it,
    /// mirroring the original's `asyncio.ensure_future(job)`.
    pub async fn merge(
        &self,
        sources: Option<Vec<String>>,
        target_name: Option<String>,
        force: bool,
        ids: Option<Vec<DocId>>,
    ) -> Result<MergeHandle, BuilderError> {
        let started_at = Utc::now();

        if !force {
            self.check_ready().await?;
        }

        let build_config = self
            .source_backend
            .get_build_configuration(&self.build_name)
            .await?;

        self.target_backend
            .set_target_name(target_name.clone(), &self.build_name)
            .await?;

        let full_rebuild = sources.is_none();
        let requested = sources.unwrap_or_else(|| build_config.sources.clone());

        if full_rebuild {
            self.target_backend.drop_target().await?;
            self.target_backend.prepare().await?;
        }

        let resolved = resolve_sources(self.source_backend.as_ref(), &requested).await?;
        if resolved.is_empty() {
            return Err(BuilderError::ResolutionEmpty);
        }

        let archive_prefix = target_name.unwrap_or_else(|| self.build_name.to_string());
        self.clean_old_collections(&archive_prefix).await?;

        tracing::info!(
            build_name = %self.build_name,
            target = %self.target_backend.target_name().await,
            sources = ?resolved,
            "merging into target collection",
        );

        self.begin_history(started_at, resolved.clone()).await?;

        let this = self.clone();
        let handle = tokio::spawn(async move {
            let result = this.merge_sources(&resolved, true, this.config.batch_size, ids).await;
            match &result {
                Ok(stats) => {
                    if let Err(e) = this.finish_success(started_at, stats.clone()).await {
                        tracing::error!(build_name = %this.build_name, error = %e, "failed to record successful build in history");
                    }
                }
                Err(err) => {
                    tracing::error!(build_name = %this.build_name, error = %err, "merge failed");
                    if let Err(e) = this.finish_failure(started_at, err).await {
                        tracing::error!(build_name = %this.build_name, error = %e, "failed to record failed build in history");
                    }
                }
            }
            result
        });

        Ok(MergeHandle(handle))
    }

    /// `merge_sources(source_names, steps, batch_size, ids)`, SPEC_FULL
    /// §4.2: root sources complete before other sources begin, then
    /// `finalize()`, then an optional post-merge task on the thread pool.
    async fn merge_sources(
        &self,
        source_names: &[String],
        do_post: bool,
        batch_size: usize,
        ids: Option<Vec<DocId>>,
    ) -> Result<BuildStats, BuilderError> {
        let build_config = self
            .source_backend
            .get_build_configuration(&self.build_name)
            .await?;
        let declared_root =
            get_root_document_sources(&build_config.sources, &build_config.root_sources_raw())?;
        let defined_root = resolve_sources(self.source_backend.as_ref(), &declared_root).await?;

        let (root, other) = sources::partition_root_other(source_names, &defined_root);

        if !defined_root.is_empty() && root.is_empty() {
            tracing::warn!(
                build_name = %self.build_name,
                ?defined_root,
                "root document sources are defined but none are part of this merge",
            );
        }

        tracing::info!(build_name = %self.build_name, ?root, ?other, "sources classified for merge");

        let aborted = Arc::new(AtomicBool::new(false));
        let mut stats = BuildStats::new();

        if !root.is_empty() {
            self.update_step(BuildStep::MergeRoot, root.clone()).await?;
            let root_stats = self
                .merge_class(&root, batch_size, ids.clone(), aborted.clone())
                .await?;
            stats.extend(root_stats);
        }

        if !other.is_empty() {
            self.update_step(BuildStep::MergeOthers, other.clone())
                .await?;
            let other_stats = self
                .merge_class(&other, batch_size, ids.clone(), aborted.clone())
                .await?;
            stats.extend(other_stats);
        }

        self.update_step(BuildStep::Finalizing, source_names.to_vec())
            .await?;
        self.target_backend.finalize().await?;

        if do_post {
            self.update_step(BuildStep::PostMerge, source_names.to_vec())
                .await?;
            let target = self.target_backend.clone();
            let target_name = target.target_name().await;
            let pinfo = PInfo {
                category: "builder".to_string(),
                source: format!("{}:{}", self.build_name, target_name),
                step: "post-merge".to_string(),
                description: String::new(),
            };
            self.job_manager
                .defer_to_thread(pinfo, async move { target.post_merge().await })
                .await?;
        }

        Ok(stats)
    }

    /// Merge every source in `names` concurrently (no ordering among
    /// them), stopping new batch submissions across the whole class as
    /// soon as any one source fails, but letting already-submitted
    /// batches complete -- SPEC_FULL §4.2, §5.
    async fn merge_class(
        &self,
        names: &[String],
        batch_size: usize,
        ids: Option<Vec<DocId>>,
        aborted: Arc<AtomicBool>,
    ) -> Result<BuildStats, BuilderError> {
        let mut tasks = FuturesUnordered::new();
        for name in names {
            tokio::task::yield_now().await;
            if aborted.load(Ordering::SeqCst) {
                break;
            }
            let this = self.clone();
            let name = name.clone();
            let ids = ids.clone();
            let aborted = aborted.clone();
            tasks.push(async move {
                let result = this.merge_source(&name, batch_size, ids, aborted).await;
                (name, result)
            });
        }

        let mut stats = BuildStats::new();
        let mut first_error: Option<BuilderError> = None;
        while let Some((name, result)) = tasks.next().await {
            match result {
                Ok(count) => {
                    stats.insert(name, count);
                }
                Err(err) => {
                    aborted.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(stats),
        }
    }

    /// `merge_source(src_name, batch_size, ids)`, SPEC_FULL §4.2: reads
    /// ids in id-batches of `10 x batch_size`, slices into merge-batches
    /// of `batch_size`, and submits each to the worker-process pool.
    async fn merge_source(
        &self,
        src_name: &str,
        batch_size: usize,
        ids: Option<Vec<DocId>>,
        aborted: Arc<AtomicBool>,
    ) -> Result<i64, BuilderError> {
        let build_config = self
            .source_backend
            .get_build_configuration(&self.build_name)
            .await?;
        let declared_root =
            get_root_document_sources(&build_config.sources, &build_config.root_sources_raw())?;
        let defined_root = resolve_sources(self.source_backend.as_ref(), &declared_root).await?;
        let upsert = defined_root.is_empty() || defined_root.iter().any(|s| s == src_name);
        if !upsert {
            tracing::debug!(
                source = %src_name,
                "documents from this source are stored only if a matching target document already exists",
            );
        }

        let mapper_name = get_mapper_for_source(self.source_backend.as_ref(), src_name).await?;
        let total = self.source_backend.count(src_name).await?;
        let id_batch_size = batch_size * 10;

        // Open question resolved per SPEC_FULL §9: the second assignment in
        // the original is authoritative -- an explicit `ids` list always
        // wins over the id-feeder, regardless of any earlier shadowed form.
        let mut id_provider: BoxStream<'static, Result<Vec<DocId>, StoreError>> = match ids {
            Some(ids) => futures::stream::once(futures::future::ready(Ok(ids))).boxed(),
            None => self.source_backend.id_feeder(src_name, id_batch_size),
        };

        let src_conn = self.source_backend.connection();
        let tgt_conn = self.target_backend.connection();
        let target_name = self.target_backend.target_name().await;
        let btotal = if batch_size == 0 {
            0
        } else {
            (total as f64 / batch_size as f64).ceil() as u64
        };

        let mut batches = FuturesUnordered::new();
        let mut bnum: u64 = 1;
        let mut cnt: u64 = 0;
        let mut submission_error: Option<BuilderError> = None;

        'outer: while let Some(big_ids) = id_provider.next().await {
            let big_ids = big_ids?;
            for chunk in big_ids.chunks(batch_size.max(1)) {
                tokio::task::yield_now().await;
                if aborted.load(Ordering::SeqCst) {
                    break 'outer;
                }

                cnt += chunk.len() as u64;
                let ids_json = chunk
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| BuilderError::InfrastructureError(e.to_string()))?;

                let task = MergeBatchTask {
                    source_db_uri: src_conn.uri.clone(),
                    source_db_name: src_conn.db_name.clone(),
                    target_db_uri: tgt_conn.uri.clone(),
                    target_db_name: tgt_conn.db_name.clone(),
                    source_collection: src_name.to_string(),
                    target_collection: target_name.clone(),
                    ids: ids_json,
                    mapper: mapper_name.clone(),
                    upsert,
                    batch_num: bnum,
                };

                let pinfo = PInfo {
                    category: "builder".to_string(),
                    source: format!("{}:{}", self.build_name, target_name),
                    step: src_name.to_string(),
                    description: format!(
                        "#{bnum}/{btotal} ({:.1}%)",
                        if total == 0 {
                            100.0
                        } else {
                            (cnt as f64 / total as f64) * 100.0
                        }
                    ),
                };

                tracing::info!(
                    build_name = %self.build_name,
                    source = %src_name,
                    batch_num = bnum,
                    progress = %pinfo.description,
                    "submitting merge batch",
                );

                let job_manager = self.job_manager.clone();
                let this_batch_num = bnum;
                let src_name_owned = src_name.to_string();
                batches.push(async move {
                    let reply = job_manager.defer_to_process(pinfo, task).await;
                    (this_batch_num, src_name_owned, reply)
                });
                bnum += 1;
            }
        }

        while let Some((batch_num, source, reply)) = batches.next().await {
            match reply {
                Ok(reply) => match reply.response {
                    WorkerResponse::Merged { .. } => {}
                    WorkerResponse::Failed {
                        message, dump_file, ..
                    } => {
                        aborted.store(true, Ordering::SeqCst);
                        if submission_error.is_none() {
                            submission_error = Some(BuilderError::BatchFailure {
                                source,
                                batch_num,
                                message,
                                dump_file,
                            });
                        }
                    }
                },
                Err(err) => {
                    aborted.store(true, Ordering::SeqCst);
                    if submission_error.is_none() {
                        submission_error = Some(err.into());
                    }
                }
            }
        }

        match submission_error {
            Some(err) => Err(err),
            // `stats` counts ids fed to this source, not worker write
            // counts: a non-root batch's no-op (no pre-existing document
            // to update) still consumed an id and must be reflected here.
            None => Ok(cnt as i64),
        }
    }

    /// Retention: drop archived target collections sharing `prefix` beyond
    /// `keep_archive`, relying on the fixed-width timestamp suffix to sort
    /// lexicographically newest-first (SPEC_FULL §3, §9).
    async fn clean_old_collections(&self, prefix: &str) -> Result<(), BuilderError> {
        let search_prefix = format!("{prefix}_");
        let collections = self
            .target_backend
            .list_collections_with_prefix(&search_prefix)
            .await?;
        for stale in collections.into_iter().skip(self.config.keep_archive) {
            tracing::info!(build_name = %self.build_name, collection = %stale, "dropping old archived collection");
            self.target_backend.drop_collection(&stale).await?;
        }
        Ok(())
    }

    fn logfile_path(&self, started_at: DateTime<Utc>) -> String {
        format!(
            "{}/{}_{}_build.log",
            self.config.log_folder,
            self.build_name,
            started_at.format("%Y%m%d"),
        )
    }

    /// `register_status("building", transient=true, init=true)`: append a
    /// new history entry and clear `pending_to_build` in the same write
    /// (SPEC_FULL §4.2).
    async fn begin_history(
        &self,
        started_at: DateTime<Utc>,
        sources: Vec<String>,
    ) -> Result<(), BuilderError> {
        let target_name = self.target_backend.target_name().await;
        let entry = BuildHistoryEntry::transient(
            BuildStep::Init,
            sources,
            started_at,
            self.logfile_path(started_at),
            self.target_backend.backend_name().to_string(),
            target_name,
            std::process::id(),
        );
        self.source_backend
            .append_history(&self.build_name, entry, self.config.max_build_status)
            .await?;
        self.source_backend
            .clear_pending_to_build(&self.build_name)
            .await?;
        Ok(())
    }

    /// `register_status("building", transient=true, init=false, step=...)`:
    /// merge-patch the last history entry in place.
    async fn update_step(&self, step: BuildStep, sources: Vec<String>) -> Result<(), BuilderError> {
        let patch = serde_json::json!({
            "status": BuildStatus::Building,
            "step": step,
            "sources": sources,
            "step_started_at": Utc::now(),
            "pid": std::process::id(),
        });
        self.source_backend
            .merge_last_history(&self.build_name, patch)
            .await?;
        self.source_backend
            .clear_pending_to_build(&self.build_name)
            .await?;
        Ok(())
    }

    /// `store_stats` on success: the sole terminal `success` write for a
    /// merge, carrying `stats` and `src_version`.
    async fn finish_success(
        &self,
        started_at: DateTime<Utc>,
        stats: BuildStats,
    ) -> Result<(), BuilderError> {
        let src_version = self.source_backend.get_src_versions().await?;
        let elapsed = Utc::now() - started_at;
        let patch = serde_json::json!({
            "status": BuildStatus::Success,
            "pid": serde_json::Value::Null,
            "time": humantime::format_duration(to_std_duration(elapsed)).to_string(),
            "time_in_s": elapsed.num_milliseconds() as f64 / 1000.0,
            "stats": stats,
            "src_version": src_version,
        });
        self.source_backend
            .merge_last_history(&self.build_name, patch)
            .await?;
        tracing::info!(build_name = %self.build_name, ?stats, ?src_version, "build succeeded");
        Ok(())
    }

    /// `store_stats` on failure: the sole terminal `failed` write for a
    /// merge, carrying the error text verbatim.
    async fn finish_failure(
        &self,
        started_at: DateTime<Utc>,
        err: &BuilderError,
    ) -> Result<(), BuilderError> {
        let elapsed = Utc::now() - started_at;
        let patch = serde_json::json!({
            "status": BuildStatus::Failed,
            "pid": serde_json::Value::Null,
            "time": humantime::format_duration(to_std_duration(elapsed)).to_string(),
            "time_in_s": elapsed.num_milliseconds() as f64 / 1000.0,
            "err": err.to_string(),
        });
        self.source_backend
            .merge_last_history(&self.build_name, patch)
            .await?;
        Ok(())
    }
}

fn to_std_duration(elapsed: chrono::Duration) -> std::time::Duration {
    elapsed.to_std().unwrap_or(std::time::Duration::ZERO)
}
