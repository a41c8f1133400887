use crate::{
    id_feeder, DocId, Document, SourceBackend, SourceConnection, StoreError, TargetBackend,
    TargetConnection,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, TryStreamExt};
use mongodb::bson::{doc, to_bson};
use mongodb::options::UpdateOptions;
use mongodb::{Collection, Database};
use models::{BuildConfig, BuildHistoryEntry, SourceMaster};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// `SourceBackend` implemented against a MongoDB database holding the
/// `build configurations`, `source master documents` and `upload journal`
/// collections described in SPEC_FULL §6, plus the per-source raw
/// collections themselves.
pub struct MongoSourceBackend {
    meta_db: Database,
    src_db: Database,
    src_uri: String,
    build_collection: String,
    master_collection: String,
    dump_collection: String,
}

impl MongoSourceBackend {
    pub fn new(meta_db: Database, src_db: Database, src_uri: String) -> Self {
        Self {
            meta_db,
            src_db,
            src_uri,
            build_collection: "src_build".to_string(),
            master_collection: "src_master".to_string(),
            dump_collection: "src_dump".to_string(),
        }
    }

    fn build_col(&self) -> Collection<BuildConfig> {
        self.meta_db.collection(&self.build_collection)
    }

    fn master_col(&self) -> Collection<SourceMaster> {
        self.meta_db.collection(&self.master_collection)
    }

    fn dump_col(&self) -> Collection<Document> {
        self.meta_db.collection(&self.dump_collection)
    }
}

#[async_trait]
impl SourceBackend for MongoSourceBackend {
    async fn get_build_configuration(&self, build_name: &str) -> Result<BuildConfig, StoreError> {
        self.build_col()
            .find_one(doc! { "_id": build_name }, None)
            .await?
            .ok_or_else(|| StoreError::BuildConfigNotFound(build_name.to_string()))
    }

    async fn list_build_configurations(&self) -> Result<Vec<BuildConfig>, StoreError> {
        let mut cursor = self.build_col().find(doc! {}, None).await?;
        let mut out = Vec::new();
        while let Some(cfg) = cursor.try_next().await? {
            out.push(cfg);
        }
        Ok(out)
    }

    async fn append_history(
        &self,
        build_name: &str,
        entry: BuildHistoryEntry,
        max_build_status: usize,
    ) -> Result<(), StoreError> {
        let entry_bson = to_bson(&entry).map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.build_col()
            .update_one(
                doc! { "_id": build_name },
                doc! { "$push": { "build": entry_bson } },
                None,
            )
            .await?;

        let cfg = self.get_build_configuration(build_name).await?;
        if cfg.build.len() > max_build_status {
            let howmany = cfg.build.len() - max_build_status;
            for _ in 0..howmany {
                self.build_col()
                    .update_one(
                        doc! { "_id": build_name },
                        doc! { "$pop": { "build": -1 } },
                        None,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn merge_last_history(
        &self,
        build_name: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut cfg = self.get_build_configuration(build_name).await?;
        let last = cfg
            .build
            .back_mut()
            .ok_or_else(|| StoreError::Malformed("no history entry to update".to_string()))?;

        let mut last_json =
            serde_json::to_value(&*last).map_err(|e| StoreError::Malformed(e.to_string()))?;
        if let (Some(obj), Some(patch_obj)) = (last_json.as_object_mut(), patch.as_object()) {
            for (k, v) in patch_obj {
                obj.insert(k.clone(), v.clone());
            }
        }
        *last = serde_json::from_value(last_json).map_err(|e| StoreError::Malformed(e.to_string()))?;

        self.build_col()
            .replace_one(doc! { "_id": build_name }, &cfg, None)
            .await?;
        Ok(())
    }

    async fn clear_pending_to_build(&self, build_name: &str) -> Result<(), StoreError> {
        self.build_col()
            .update_one(
                doc! { "_id": build_name },
                doc! { "$set": { "pending_to_build": false } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn get_src_master_docs(&self) -> Result<Vec<SourceMaster>, StoreError> {
        let mut cursor = self.master_col().find(doc! {}, None).await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.src_db.list_collection_names(None).await?)
    }

    async fn is_source_ready(&self, src_name: &str) -> Result<bool, StoreError> {
        let mut cursor = self.dump_col().find(doc! {}, None).await?;
        while let Some(doc) = cursor.try_next().await? {
            let status = doc
                .get_document("upload")
                .and_then(|u| u.get_document("jobs"))
                .and_then(|jobs| jobs.get_document(src_name))
                .ok()
                .and_then(|job| job.get_str("status").ok());
            if status == Some("success") {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn get_src_versions(&self) -> Result<BTreeMap<String, String>, StoreError> {
        let mut cursor = self.dump_col().find(doc! {}, None).await?;
        let mut versions = BTreeMap::new();
        while let Some(doc) = cursor.try_next().await? {
            if let (Ok(id), Ok(release)) = (doc.get_str("_id"), doc.get_str("release")) {
                versions.insert(id.to_string(), release.to_string());
            }
        }
        Ok(versions)
    }

    async fn count(&self, collection: &str) -> Result<u64, StoreError> {
        let col: Collection<Document> = self.src_db.collection(collection);
        Ok(col.count_documents(doc! {}, None).await?)
    }

    fn id_feeder(
        &self,
        collection: &str,
        batch_size: usize,
    ) -> BoxStream<'static, Result<Vec<DocId>, StoreError>> {
        let col: Collection<Document> = self.src_db.collection(collection);
        id_feeder(col, batch_size)
    }

    async fn fetch_documents(
        &self,
        collection: &str,
        ids: &[DocId],
    ) -> Result<Vec<Document>, StoreError> {
        let col: Collection<Document> = self.src_db.collection(collection);
        let mut cursor = col
            .find(doc! { "_id": { "$in": ids.to_vec() } }, None)
            .await?;
        let mut out = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            out.push(doc);
        }
        Ok(out)
    }

    fn connection(&self) -> SourceConnection {
        SourceConnection {
            uri: self.src_uri.clone(),
            db_name: self.src_db.name().to_string(),
        }
    }
}

/// `TargetBackend` implemented against a single MongoDB database holding
/// one collection per build run.
pub struct MongoTargetBackend {
    db: Database,
    uri: String,
    target_name: RwLock<Option<String>>,
}

impl MongoTargetBackend {
    pub fn new(db: Database, uri: String) -> Self {
        Self {
            db,
            uri,
            target_name: RwLock::new(None),
        }
    }

    async fn require_target_name(&self) -> String {
        self.target_name
            .read()
            .await
            .clone()
            .expect("set_target_name must be called before any other TargetBackend method")
    }
}

#[async_trait]
impl TargetBackend for MongoTargetBackend {
    fn backend_name(&self) -> &str {
        "mongo"
    }

    async fn set_target_name(
        &self,
        target_name: Option<String>,
        build_name: &str,
    ) -> Result<(), StoreError> {
        let prefix = target_name.unwrap_or_else(|| build_name.to_string());
        let suffix = chrono::Utc::now().format("%Y%m%d").to_string();
        // Retention (`list_collections_with_prefix`) sorts lexicographically
        // and relies on this being fixed-width -- see SPEC_FULL §9.
        debug_assert_eq!(suffix.len(), 8, "target suffix must stay fixed-width");
        *self.target_name.write().await = Some(format!("{prefix}_{suffix}"));
        Ok(())
    }

    async fn target_name(&self) -> String {
        self.require_target_name().await
    }

    async fn drop_target(&self) -> Result<(), StoreError> {
        let name = self.require_target_name().await;
        let col: Collection<Document> = self.db.collection(&name);
        col.drop(None).await?;
        Ok(())
    }

    async fn prepare(&self) -> Result<(), StoreError> {
        let name = self.require_target_name().await;
        let existing = self.db.list_collection_names(doc! { "name": &name }).await?;
        if existing.is_empty() {
            self.db.create_collection(&name, None).await?;
        }
        Ok(())
    }

    async fn write_batch(&self, docs: Vec<Document>, upsert: bool) -> Result<i64, StoreError> {
        let name = self.require_target_name().await;
        let col: Collection<Document> = self.db.collection(&name);

        let mut written = 0i64;
        for mut doc in docs {
            let id = doc
                .remove("_id")
                .ok_or_else(|| StoreError::Malformed("mapped document missing _id".to_string()))?;
            let opts = UpdateOptions::builder().upsert(upsert).build();
            let result = col
                .update_one(doc! { "_id": id }, doc! { "$set": doc }, opts)
                .await?;
            if result.modified_count > 0 || result.upserted_id.is_some() {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn finalize(&self) -> Result<(), StoreError> {
        // No secondary indexes or compaction are required by this domain;
        // the hook exists so future builders can override it.
        Ok(())
    }

    async fn post_merge(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn list_collections_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("^{}", regex::escape(prefix));
        let mut names = self
            .db
            .list_collection_names(doc! { "name": { "$regex": pattern } })
            .await?;
        // Fixed-width timestamp suffix sorts chronologically; see SPEC_FULL §9.
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    async fn drop_collection(&self, name: &str) -> Result<(), StoreError> {
        let col: Collection<Document> = self.db.collection(name);
        col.drop(None).await?;
        Ok(())
    }

    fn connection(&self) -> TargetConnection {
        TargetConnection {
            uri: self.uri.clone(),
            db_name: self.db.name().to_string(),
        }
    }
}
