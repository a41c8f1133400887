//! Domain types shared by the builder, builder-manager and store crates.
//!
//! These are plain data definitions with no merge logic attached: the
//! algorithms that interpret them (root-source resolution, history eviction,
//! readiness checks) live in `builder` and `builder-manager`.

mod build_config;
mod history;
mod source_master;

pub use build_config::{default_root_key, BuildConfig};
pub use history::{BuildHistoryEntry, BuildStatus, BuildStep};
pub use source_master::SourceMaster;

/// Name of a source collection, which may be a literal collection name or
/// a regex to be resolved against the live collection catalog (see
/// `BuildConfig::sources` and the master document's `name` field).
pub type SourceName = String;
