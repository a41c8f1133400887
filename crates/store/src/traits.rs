use crate::{DocId, Document, StoreError};
use async_trait::async_trait;
use futures::stream::BoxStream;
use models::{BuildConfig, BuildHistoryEntry, SourceMaster};
use std::collections::BTreeMap;

/// Where a source's raw collections physically live, for the worker
/// process to open its own connection (the Builder never opens one
/// itself -- see SPEC_FULL §4.1.1).
#[derive(Debug, Clone)]
pub struct SourceConnection {
    pub uri: String,
    pub db_name: String,
}

/// Where the target collection physically lives, for the same reason.
#[derive(Debug, Clone)]
pub struct TargetConnection {
    pub uri: String,
    pub db_name: String,
}

/// Read-only facade over build metadata: configurations, master documents,
/// the live collection catalog, and per-source readiness -- plus the
/// small, idempotent field-level history updates the Builder performs as a
/// build progresses (never a read-modify-write of the whole document,
/// except the single final replace of the last history entry; see
/// SPEC_FULL §5).
#[async_trait]
pub trait SourceBackend: Send + Sync {
    async fn get_build_configuration(&self, build_name: &str) -> Result<BuildConfig, StoreError>;

    async fn list_build_configurations(&self) -> Result<Vec<BuildConfig>, StoreError>;

    /// Append a new history entry, evicting from the oldest end until the
    /// list is within `max_build_status`.
    async fn append_history(
        &self,
        build_name: &str,
        entry: BuildHistoryEntry,
        max_build_status: usize,
    ) -> Result<(), StoreError>;

    /// Merge-patch the last history entry in place. The caller (the
    /// Builder) guarantees a history entry already exists.
    async fn merge_last_history(
        &self,
        build_name: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn clear_pending_to_build(&self, build_name: &str) -> Result<(), StoreError>;

    /// Master documents, in a stable (insertion) order -- the original
    /// implementation's mapper resolution depends on dict iteration order
    /// when more than one master pattern matches a source name, which this
    /// crate fixes to insertion order rather than leaving it unspecified.
    async fn get_src_master_docs(&self) -> Result<Vec<SourceMaster>, StoreError>;

    /// The live source-database collection catalog, used to resolve
    /// regex-bearing source names.
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Readiness probe: does an upload journal entry exist for `src_name`
    /// whose own `status` is `"success"`.
    async fn is_source_ready(&self, src_name: &str) -> Result<bool, StoreError>;

    async fn get_src_versions(&self) -> Result<BTreeMap<String, String>, StoreError>;

    async fn count(&self, collection: &str) -> Result<u64, StoreError>;

    /// Stream of id-batches (the "metadata cursor"), each of size at most
    /// `batch_size`, covering every document id in `collection`.
    fn id_feeder(
        &self,
        collection: &str,
        batch_size: usize,
    ) -> BoxStream<'static, Result<Vec<DocId>, StoreError>>;

    async fn fetch_documents(
        &self,
        collection: &str,
        ids: &[DocId],
    ) -> Result<Vec<Document>, StoreError>;

    /// Connection coordinates a worker process uses to read `collection`
    /// directly, bypassing this trait object (which cannot itself cross a
    /// process boundary).
    fn connection(&self) -> SourceConnection;
}

/// Write facade over the single target collection of one build.
#[async_trait]
pub trait TargetBackend: Send + Sync {
    /// Identity of this backend kind, recorded in history as
    /// `target_backend` (e.g. `"mongo"`).
    fn backend_name(&self) -> &str;

    /// Resolve and fix the target collection name for this build. Must be
    /// called once before any other method. `target_name` is the caller's
    /// explicit override, if any; otherwise `build_name` is used as the
    /// prefix, per SPEC_FULL §3.1.
    async fn set_target_name(
        &self,
        target_name: Option<String>,
        build_name: &str,
    ) -> Result<(), StoreError>;

    async fn target_name(&self) -> String;

    async fn drop_target(&self) -> Result<(), StoreError>;

    async fn prepare(&self) -> Result<(), StoreError>;

    /// Write a batch of already-mapped documents, keyed by their own
    /// `_id`. Returns the number of documents written. `upsert = false`
    /// means: update only documents that already exist, creating none.
    async fn write_batch(&self, docs: Vec<Document>, upsert: bool) -> Result<i64, StoreError>;

    async fn finalize(&self) -> Result<(), StoreError>;

    async fn post_merge(&self) -> Result<(), StoreError>;

    /// Collections in the target database sharing `prefix`, most-recent
    /// first (lexicographic descending, relying on a fixed-width timestamp
    /// suffix -- see SPEC_FULL §9 open question).
    async fn list_collections_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError>;

    /// Connection coordinates a worker process uses to write the target
    /// collection directly.
    fn connection(&self) -> TargetConnection;
}
