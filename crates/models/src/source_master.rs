use serde::{Deserialize, Serialize};

/// A per-source master document. When `name` differs from `id`, `name` is
/// the regex pattern used to resolve this source against the live
/// collection catalog (e.g. `id: "chr"`, `name: "chr_.*"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMaster {
    #[serde(rename = "_id")]
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapper: Option<String>,
}

impl SourceMaster {
    pub fn literal(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            mapper: None,
        }
    }

    pub fn regex(id: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: pattern.into(),
            mapper: None,
        }
    }

    /// The pattern to anchor and match against the live collection catalog:
    /// `name` when it differs from `id` (a declared regex), otherwise `id`
    /// itself treated as a literal pattern.
    pub fn match_pattern(&self) -> &str {
        if self.id != self.name {
            &self.name
        } else {
            &self.id
        }
    }
}
