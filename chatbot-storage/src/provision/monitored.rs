//! Collection wrapper reporting network failures

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::document::{
    BulkOutcome, Document, DocumentCollection, Filter, FindOneAndUpdateOptions, FindOptions,
    IndexSpec, Update, UpdateOne, UpdateOutcome,
};
use crate::error::{DatabaseError, DbResult};
use crate::health::HealthMonitor;

/// A collection whose network-class failures are tallied by a [`HealthMonitor`]
///
/// Errors pass through unchanged after being counted.
#[derive(Clone)]
pub struct MonitoredCollection {
    inner: Arc<dyn DocumentCollection>,
    health: Arc<HealthMonitor>,
}

impl MonitoredCollection {
    /// Wrap a collection
    pub fn new(inner: Arc<dyn DocumentCollection>, health: Arc<HealthMonitor>) -> Self {
        Self { inner, health }
    }

    fn observe(&self, err: DatabaseError) -> DatabaseError {
        if self.health.record_failure(&err.kind) {
            tracing::warn!(
                collection = self.inner.name(),
                operation = %err.operation,
                error = %err,
                "network failure on collection"
            );
        }
        err
    }
}

#[async_trait]
impl DocumentCollection for MonitoredCollection {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn indexes(&self) -> DbResult<Vec<IndexSpec>> {
        self.inner.indexes().await.map_err(|e| self.observe(e))
    }

    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        self.inner.create_index(spec).await.map_err(|e| self.observe(e))
    }

    async fn drop_index(&self, name: &str) -> DbResult<()> {
        self.inner.drop_index(name).await.map_err(|e| self.observe(e))
    }

    async fn insert_one(&self, doc: Document) -> DbResult<String> {
        self.inner.insert_one(doc).await.map_err(|e| self.observe(e))
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> DbResult<Vec<Document>> {
        self.inner
            .find(filter, options)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn find_one(&self, filter: &Filter, options: &FindOptions) -> DbResult<Option<Document>> {
        self.inner
            .find_one(filter, options)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn count(&self, filter: &Filter) -> DbResult<u64> {
        self.inner.count(filter).await.map_err(|e| self.observe(e))
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        options: &FindOneAndUpdateOptions,
    ) -> DbResult<Option<Document>> {
        self.inner
            .find_one_and_update(filter, update, options)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> DbResult<UpdateOutcome> {
        self.inner
            .update_one(filter, update, upsert)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn bulk_update(&self, operations: &[UpdateOne], ordered: bool) -> DbResult<BulkOutcome> {
        self.inner
            .bulk_update(operations, ordered)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn delete_one(&self, filter: &Filter) -> DbResult<u64> {
        self.inner.delete_one(filter).await.map_err(|e| self.observe(e))
    }

    async fn delete_many(&self, filter: &Filter) -> DbResult<u64> {
        self.inner.delete_many(filter).await.map_err(|e| self.observe(e))
    }

    async fn find_one_and_delete(&self, filter: &Filter) -> DbResult<Option<Document>> {
        self.inner
            .find_one_and_delete(filter)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> DbResult<Vec<Value>> {
        self.inner
            .distinct(field, filter)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn group_count(&self, filter: &Filter, field: &str) -> DbResult<Vec<(Value, u64)>> {
        self.inner
            .group_count(filter, field)
            .await
            .map_err(|e| self.observe(e))
    }

    async fn drop_collection(&self) -> DbResult<()> {
        self.inner.drop_collection().await.map_err(|e| self.observe(e))
    }
}
