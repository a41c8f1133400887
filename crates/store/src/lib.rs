//! Read/write facades over the document store, per the spec's "Source
//! Backend" and "Target Backend" components (§2). The merge engine in
//! `builder` never talks to `mongodb` directly -- it only ever sees
//! `SourceBackend`/`TargetBackend`, so a different document store could be
//! substituted by implementing these two traits.

mod error;
mod id_feeder;
mod mongo;
mod traits;

pub use error::StoreError;
pub use id_feeder::id_feeder;
pub use mongo::{MongoSourceBackend, MongoTargetBackend};
pub use traits::{SourceBackend, SourceConnection, TargetBackend, TargetConnection};

/// A document id as read back from the store. Source documents in this
/// domain key on heterogeneous scalar ids (strings, ints), so ids are kept
/// as opaque BSON values rather than coerced to a single Rust type.
pub type DocId = mongodb::bson::Bson;
pub type Document = mongodb::bson::Document;
