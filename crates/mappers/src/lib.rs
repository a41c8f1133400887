//! Named document transforms applied during a merge (spec §4.4). A mapper
//! is resolved by name from a `MapperRegistry`, lazily loaded at most once,
//! then applied to each merge batch. The registry itself carries no
//! knowledge of *which* mappers a deployment needs -- those are registered
//! by the embedding application; this crate only supplies the contract and
//! the always-present default transparent mapper.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use store::Document;

/// The sentinel name used when a source declares no mapper.
pub const DEFAULT_MAPPER_NAME: &str = "_default";

#[derive(Debug, thiserror::Error)]
pub enum MapperError {
    #[error("unknown mapper '{0}'")]
    UnknownMapper(String),

    #[error("mapper '{name}' failed to load: {source}")]
    LoadFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("mapper '{name}' failed to process a batch: {source}")]
    ProcessFailed {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// A named transform from raw source documents to documents ready for the
/// target collection. `process` may drop or fan a single input document out
/// to zero or more outputs (e.g. one-to-many annotation joins), but must be
/// deterministic given the same input batch and post-`load` state.
#[async_trait]
pub trait Mapper: Send + Sync {
    fn name(&self) -> &str;

    /// Whether `load` still needs to run. Checked before every batch so a
    /// mapper can be constructed once per worker and reused across batches.
    fn need_load(&self) -> bool {
        false
    }

    /// Perform one-time setup (e.g. reading a reference file). Must be safe
    /// to call more than once; idempotent after the first success.
    async fn load(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn process(&self, docs: Vec<Document>) -> Result<Vec<Document>, anyhow::Error>;
}

/// Passes documents through unchanged. Always registered under
/// [`DEFAULT_MAPPER_NAME`].
struct TransparentMapper;

#[async_trait]
impl Mapper for TransparentMapper {
    fn name(&self) -> &str {
        DEFAULT_MAPPER_NAME
    }

    fn process(&self, docs: Vec<Document>) -> Result<Vec<Document>, anyhow::Error> {
        Ok(docs)
    }
}

/// A name -> mapper table. Construction always seeds the default
/// transparent mapper; callers register their own named mappers on top.
#[derive(Clone)]
pub struct MapperRegistry {
    mappers: HashMap<String, Arc<dyn Mapper>>,
}

impl Default for MapperRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MapperRegistry {
    pub fn new() -> Self {
        let mut mappers: HashMap<String, Arc<dyn Mapper>> = HashMap::new();
        mappers.insert(DEFAULT_MAPPER_NAME.to_string(), Arc::new(TransparentMapper));
        Self { mappers }
    }

    /// Register a mapper, overwriting any prior registration under the same
    /// name. Registering under [`DEFAULT_MAPPER_NAME`] replaces the
    /// transparent mapper.
    pub fn register(&mut self, mapper: Arc<dyn Mapper>) {
        self.mappers.insert(mapper.name().to_string(), mapper);
    }

    /// Resolve a mapper by name, lazily loading it if needed.
    pub async fn resolve(&self, name: &str) -> Result<Arc<dyn Mapper>, MapperError> {
        let mapper = self
            .mappers
            .get(name)
            .cloned()
            .ok_or_else(|| MapperError::UnknownMapper(name.to_string()))?;

        if mapper.need_load() {
            mapper
                .load()
                .await
                .map_err(|source| MapperError::LoadFailed {
                    name: name.to_string(),
                    source,
                })?;
        }
        Ok(mapper)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.mappers.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_mapper_is_always_registered() {
        let registry = MapperRegistry::new();
        let mapper = registry.resolve(DEFAULT_MAPPER_NAME).await.unwrap();
        let docs = vec![mongodb::bson::doc! { "_id": "a", "x": 1 }];
        let out = mapper.process(docs.clone()).unwrap();
        assert_eq!(out, docs);
    }

    #[tokio::test]
    async fn unknown_mapper_name_is_an_error() {
        let registry = MapperRegistry::new();
        let err = registry.resolve("does-not-exist").await.unwrap_err();
        assert!(matches!(err, MapperError::UnknownMapper(name) if name == "does-not-exist"));
    }

    struct CountingMapper {
        loaded: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Mapper for CountingMapper {
        fn name(&self) -> &str {
            "counting"
        }

        fn need_load(&self) -> bool {
            !self.loaded.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn load(&self) -> Result<(), anyhow::Error> {
            self.loaded.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn process(&self, docs: Vec<Document>) -> Result<Vec<Document>, anyhow::Error> {
            Ok(docs)
        }
    }

    #[tokio::test]
    async fn custom_mapper_loads_at_most_once() {
        let mut registry = MapperRegistry::new();
        registry.register(Arc::new(CountingMapper {
            loaded: std::sync::atomic::AtomicBool::new(false),
        }));

        let first = registry.resolve("counting").await.unwrap();
        assert!(!first.need_load());
        let second = registry.resolve("counting").await.unwrap();
        assert!(!second.need_load());
    }
}
