use crate::StoreError;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use mongodb::bson::{doc, Bson};
use mongodb::options::FindOptions;
use mongodb::Collection;

/// Build an id-batch cursor over `collection`: a `Stream` yielding up to
/// `batch_size` ids at a time, covering every document. This is the
/// "metadata cursor" behind the spec's id-batches (§4.2) -- it only ever
/// reads `_id`, never the document body.
///
/// Implemented with the `coroutines` crate's `try_coroutine`, the same
/// yield-and-resume shape this codebase uses elsewhere to turn a
/// straight-line async loop into a `Stream` without hand-rolling
/// `poll_next`.
pub fn id_feeder(
    collection: Collection<mongodb::bson::Document>,
    batch_size: usize,
) -> BoxStream<'static, Result<Vec<Bson>, StoreError>> {
    coroutines::try_coroutine(move |mut co| async move {
        let opts = FindOptions::builder().projection(doc! { "_id": 1 }).build();
        let mut cursor = collection
            .find(doc! {}, Some(opts))
            .await
            .map_err(StoreError::Connectivity)?;

        let mut batch = Vec::with_capacity(batch_size);
        while let Some(doc) = cursor.try_next().await.map_err(StoreError::Connectivity)? {
            let id = doc
                .get("_id")
                .cloned()
                .ok_or_else(|| StoreError::Malformed("document missing _id".to_string()))?;
            batch.push(id);
            if batch.len() == batch_size {
                () = co.yield_(std::mem::take(&mut batch)).await;
            }
        }
        if !batch.is_empty() {
            () = co.yield_(batch).await;
        }
        Ok(())
    })
    .boxed()
}
