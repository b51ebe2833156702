//! Storage engine traits
//!
//! The adapters never talk to a driver directly. They need a small set of
//! primitives from the backing database, chiefly *atomic single-document*
//! conditional updates, and everything else is composed on top.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{
    BulkOutcome, Document, Filter, FindOneAndUpdateOptions, FindOptions, IndexSpec, Update,
    UpdateOne, UpdateOutcome,
};
use crate::error::DbResult;

/// A database holding named collections
#[async_trait]
pub trait DocumentEngine: Send + Sync + 'static {
    /// Names of existing collections
    async fn list_collections(&self) -> DbResult<Vec<String>>;

    /// Create a collection explicitly
    ///
    /// Fails with a duplicate-key error when the collection already exists.
    async fn create_collection(&self, name: &str) -> DbResult<()>;

    /// Handle to a collection (which may not exist yet)
    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection>;
}

/// A collection of JSON documents keyed by a string `_id`
#[async_trait]
pub trait DocumentCollection: Send + Sync + 'static {
    /// Collection name
    fn name(&self) -> &str;

    /// Indexes currently present, including the primary-key index
    async fn indexes(&self) -> DbResult<Vec<IndexSpec>>;

    /// Build an index
    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()>;

    /// Drop an index by name
    async fn drop_index(&self, name: &str) -> DbResult<()>;

    /// Insert a document, assigning `_id` when absent; returns the id
    async fn insert_one(&self, doc: Document) -> DbResult<String>;

    /// Matching documents
    async fn find(&self, filter: &Filter, options: &FindOptions) -> DbResult<Vec<Document>>;

    /// First matching document
    async fn find_one(&self, filter: &Filter, options: &FindOptions) -> DbResult<Option<Document>> {
        let options = options.clone().limit(1);
        Ok(self.find(filter, &options).await?.into_iter().next())
    }

    /// Number of matching documents
    async fn count(&self, filter: &Filter) -> DbResult<u64>;

    /// Atomically update the first matching document (or insert one)
    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        options: &FindOneAndUpdateOptions,
    ) -> DbResult<Option<Document>>;

    /// Atomically update the first matching document (or insert one)
    async fn update_one(&self, filter: &Filter, update: &Update, upsert: bool)
        -> DbResult<UpdateOutcome>;

    /// Several single-document updates in one request
    ///
    /// Ordered bulks stop at the first failure; unordered bulks attempt every
    /// operation and then report the first failure.
    async fn bulk_update(&self, operations: &[UpdateOne], ordered: bool) -> DbResult<BulkOutcome>;

    /// Delete the first matching document
    async fn delete_one(&self, filter: &Filter) -> DbResult<u64>;

    /// Delete every matching document
    async fn delete_many(&self, filter: &Filter) -> DbResult<u64>;

    /// Atomically delete and return the first matching document
    async fn find_one_and_delete(&self, filter: &Filter) -> DbResult<Option<Document>>;

    /// Distinct values of a field among matching documents
    async fn distinct(&self, field: &str, filter: &Filter) -> DbResult<Vec<Value>>;

    /// Occurrences of each value of a field, array fields unwound,
    /// most frequent first
    async fn group_count(&self, filter: &Filter, field: &str) -> DbResult<Vec<(Value, u64)>>;

    /// Drop the collection with its documents and indexes
    async fn drop_collection(&self) -> DbResult<()>;
}
