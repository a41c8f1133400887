//! Source-name resolution: regex expansion against the live collection
//! catalog, root/non-root classification, and mapper selection
//! (SPEC_FULL §4.2, §3.1).

use crate::error::BuilderError;
use models::SourceMaster;
use regex::Regex;
use std::collections::HashSet;
use store::SourceBackend;

/// Expand each (possibly regex-bearing) source name to the live collection
/// names it matches. A missing master document is a configuration error;
/// an empty match for one name is left to the caller to judge.
pub async fn resolve_sources(
    source_backend: &dyn SourceBackend,
    names: &[String],
) -> Result<Vec<String>, BuilderError> {
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let masters = source_backend.get_src_master_docs().await?;
    let catalog = source_backend.list_collections().await?;

    let mut resolved = Vec::new();
    for name in names {
        let master = masters.iter().find(|m| m.id == *name).ok_or_else(|| {
            BuilderError::BuildConfigurationError(format!(
                "no master document for source '{name}'"
            ))
        })?;
        let re = anchored_regex(master.match_pattern())?;
        for collection in &catalog {
            if re.is_match(collection) && !resolved.contains(collection) {
                resolved.push(collection.clone());
            }
        }
    }
    Ok(resolved)
}

fn anchored_regex(pattern: &str) -> Result<Regex, BuilderError> {
    Regex::new(&format!("^{pattern}$")).map_err(|e| {
        BuilderError::BuildConfigurationError(format!("invalid source pattern '{pattern}': {e}"))
    })
}

/// Classify `configured_sources` into the *declared* root set, given the
/// raw `root_key` list from the build configuration. An empty list is
/// returned unresolved (and empty) here -- "empty means every source may
/// create" is not represented by this list at all, it falls out of
/// `merge_source`'s `upsert` calculation treating an empty declared-root
/// set as "no restriction". A purely negated list (`["!a","!b"]`) means
/// every source except those named is root. Mixing the two forms is a
/// configuration error.
pub fn get_root_document_sources(
    configured_sources: &[String],
    root_raw: &[String],
) -> Result<Vec<String>, BuilderError> {
    if root_raw.is_empty() {
        return Ok(Vec::new());
    }

    let negated = root_raw.iter().filter(|s| s.starts_with('!')).count();
    if negated != 0 && negated != root_raw.len() {
        return Err(BuilderError::BuildConfigurationError(
            "root list mixes '!'-negated and positive entries".to_string(),
        ));
    }

    if negated == root_raw.len() {
        let excluded: HashSet<&str> = root_raw.iter().map(|s| s.trim_start_matches('!')).collect();
        Ok(configured_sources
            .iter()
            .filter(|s| !excluded.contains(s.as_str()))
            .cloned()
            .collect())
    } else {
        Ok(root_raw.to_vec())
    }
}

/// Scan master documents in the order they were returned (insertion
/// order -- see SPEC_FULL §3.1), anchoring each one's pattern against
/// `src_name` and keeping the *last* match, mirroring the original
/// implementation's dict-iteration-order behavior.
pub async fn get_mapper_for_source(
    source_backend: &dyn SourceBackend,
    src_name: &str,
) -> Result<String, BuilderError> {
    let masters = source_backend.get_src_master_docs().await?;

    let mut chosen: Option<&SourceMaster> = None;
    for master in &masters {
        if let Ok(re) = anchored_regex(master.match_pattern()) {
            if re.is_match(src_name) {
                chosen = Some(master);
            }
        }
    }

    let master = chosen.ok_or_else(|| {
        BuilderError::BuildConfigurationError(format!(
            "no master document matches source '{src_name}'"
        ))
    })?;

    Ok(master
        .mapper
        .clone()
        .unwrap_or_else(|| mappers::DEFAULT_MAPPER_NAME.to_string()))
}

/// Split `source_names` into the subset that is a resolved root source and
/// the remainder, both sorted, per SPEC_FULL §4.2/§5 ("root sources
/// complete before other sources begin; no ordering within a class").
pub fn partition_root_other(source_names: &[String], defined_root: &[String]) -> (Vec<String>, Vec<String>) {
    let root_set: HashSet<&str> = defined_root.iter().map(String::as_str).collect();
    let mut root: Vec<String> = source_names
        .iter()
        .filter(|s| root_set.contains(s.as_str()))
        .cloned()
        .collect();
    root.sort();
    let mut other: Vec<String> = source_names
        .iter()
        .filter(|s| !root_set.contains(s.as_str()))
        .cloned()
        .collect();
    other.sort();
    (root, other)
}

#[cfg(test)]
mod tests {
    use super::{get_root_document_sources, partition_root_other};

    #[test]
    fn empty_root_list_resolves_to_no_declared_root_sources() {
        let sources = vec!["a".to_string(), "b".to_string()];
        let root = get_root_document_sources(&sources, &[]).unwrap();
        assert!(root.is_empty());
    }

    #[test]
    fn negated_list_excludes_named_sources() {
        let sources = vec!["a", "b", "c", "d"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        let root =
            get_root_document_sources(&sources, &["!a".to_string(), "!b".to_string()]).unwrap();
        let mut root = root;
        root.sort();
        assert_eq!(root, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn positive_list_is_used_verbatim() {
        let sources = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let root = get_root_document_sources(&sources, &["a".to_string()]).unwrap();
        assert_eq!(root, vec!["a".to_string()]);
    }

    #[test]
    fn mixed_negated_and_positive_is_an_error() {
        let sources = vec!["a".to_string(), "b".to_string()];
        let err =
            get_root_document_sources(&sources, &["!a".to_string(), "b".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::BuilderError::BuildConfigurationError(_)
        ));
    }

    #[test]
    fn partition_splits_requested_sources_by_resolved_root_set() {
        let requested = vec!["b".to_string(), "a".to_string()];
        let defined_root = vec!["a".to_string()];
        let (root, other) = partition_root_other(&requested, &defined_root);
        assert_eq!(root, vec!["a".to_string()]);
        assert_eq!(other, vec!["b".to_string()]);
    }

    #[test]
    fn partition_with_no_matching_root_source_leaves_root_empty() {
        // Mirrors S3: root is defined (`{y,z}`) but the merge only requests `x`.
        let requested = vec!["x".to_string()];
        let defined_root = vec!["y".to_string(), "z".to_string()];
        let (root, other) = partition_root_other(&requested, &defined_root);
        assert!(root.is_empty());
        assert_eq!(other, vec!["x".to_string()]);
    }

    #[test]
    fn partition_with_empty_defined_root_puts_everything_in_other() {
        let requested = vec!["a".to_string(), "b".to_string()];
        let (root, other) = partition_root_other(&requested, &[]);
        assert!(root.is_empty());
        assert_eq!(other, vec!["a".to_string(), "b".to_string()]);
    }
}
