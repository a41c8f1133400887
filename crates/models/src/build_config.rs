use crate::BuildHistoryEntry;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub fn default_root_key() -> String {
    "root".to_string()
}

/// A persisted build configuration, keyed by `build_name` (its `_id`).
///
/// The field named by `root_key` (default `"root"`) is stored in `extra`
/// rather than as a dedicated struct field, because its *name* is itself
/// configurable per-document -- the same shape a schemaless document store
/// would hand back. `root_sources_raw` resolves it regardless of which key
/// it was stored under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    #[serde(rename = "_id")]
    pub build_name: String,

    pub sources: Vec<String>,

    #[serde(default = "default_root_key")]
    pub root_key: String,

    #[serde(default)]
    pub pending_to_build: bool,

    #[serde(default)]
    pub build: VecDeque<BuildHistoryEntry>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl BuildConfig {
    pub fn new(build_name: impl Into<String>, sources: Vec<String>) -> Self {
        Self {
            build_name: build_name.into(),
            sources,
            root_key: default_root_key(),
            pending_to_build: false,
            build: VecDeque::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_root(mut self, root: Vec<String>) -> Self {
        self.extra.insert(
            self.root_key.clone(),
            serde_json::Value::Array(root.into_iter().map(serde_json::Value::String).collect()),
        );
        self
    }

    /// The raw, unresolved contents of the `root_key`-named field: either a
    /// positive list, a list of `!`-prefixed exclusions, or empty.
    pub fn root_sources_raw(&self) -> Vec<String> {
        self.extra
            .get(&self.root_key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_root_key(&self) -> bool {
        self.extra.contains_key(&self.root_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_field_round_trips_under_custom_key() {
        let mut cfg = BuildConfig::new("c1", vec!["a".into(), "b".into()]);
        cfg.root_key = "creators".into();
        let cfg = cfg.with_root(vec!["a".into()]);

        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["creators"], serde_json::json!(["a"]));

        let back: BuildConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.root_sources_raw(), vec!["a".to_string()]);
    }

    #[test]
    fn defaults_to_root_key_root() {
        let cfg = BuildConfig::new("c1", vec![]);
        assert_eq!(cfg.root_key, "root");
        assert!(cfg.root_sources_raw().is_empty());
    }
}
