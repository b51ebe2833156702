//! Lazily provisioned collections
//!
//! A [`ProvisionedCollection`] resolves its backing collection on first use
//! and reconciles indexes in the background:
//!
//! 1. indexes present but not declared are dropped (the primary key stays)
//! 2. declared indexes that are missing are created
//! 3. when an index was created or the collection was empty, fixtures are
//!    inserted, duplicates ignored
//!
//! Index failures are logged and never fatal. A failed unique index marks
//! the collection in the [`HealthMonitor`] so dependents switch to their
//! degraded path; a failed text index disables full-text search.
//!
//! Concurrent first accesses share a single resolution. A failed resolution
//! is not remembered and the next access tries again.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OnceCell;

use super::{CollectionDescriptor, Dialect, MonitoredCollection};
use crate::document::{DocumentCollection, DocumentEngine, Filter, IndexSpec, PRIMARY_INDEX};
use crate::error::{DatabaseError, Result};
use crate::health::HealthMonitor;

/// How an operation uses the collection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// May run while indexes are still being reconciled
    Write,
    /// Waits until index reconciliation has finished
    Read,
}

#[derive(Clone)]
struct Resolved {
    collection: MonitoredCollection,
    reconciled: Shared<BoxFuture<'static, ()>>,
}

/// A collection resolved and reconciled on first access
pub struct ProvisionedCollection {
    name: String,
    engine: Arc<dyn DocumentEngine>,
    dialect: Dialect,
    health: Arc<HealthMonitor>,
    descriptor: RwLock<CollectionDescriptor>,
    cell: Mutex<Arc<OnceCell<Resolved>>>,
}

impl std::fmt::Debug for ProvisionedCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedCollection")
            .field("name", &self.name)
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl ProvisionedCollection {
    /// Provisioned collection for a descriptor
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        dialect: Dialect,
        health: Arc<HealthMonitor>,
        descriptor: CollectionDescriptor,
    ) -> Self {
        Self {
            name: descriptor.name().to_string(),
            engine,
            dialect,
            health,
            descriptor: RwLock::new(descriptor),
            cell: Mutex::new(Arc::new(OnceCell::new())),
        }
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dialect in use
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Health monitor receiving this collection's failures
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Declare one more index
    ///
    /// Takes effect on the next provisioning, so call it before first use.
    pub fn add_index(&self, spec: IndexSpec) -> Result<()> {
        let mut descriptor = self
            .descriptor
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        descriptor.add_index(spec)?;
        if self.current_cell().initialized() {
            tracing::warn!(
                collection = %self.name,
                "index declared after provisioning, applied on next provisioning"
            );
        }
        Ok(())
    }

    /// Whether a declared unique index could not be built
    pub fn unique_unavailable(&self) -> bool {
        self.health.unique_unavailable(&self.name)
    }

    /// Whether searches may use full-text queries
    pub fn text_search_available(&self) -> bool {
        self.dialect.supports_text_search() && !self.health.text_search_unavailable(&self.name)
    }

    /// Handle to the collection, provisioning it on first use
    pub async fn handle(&self, access: Access) -> Result<Arc<dyn DocumentCollection>> {
        let resolved = self.resolve().await?;
        if access == Access::Read {
            resolved.reconciled.clone().await;
        }
        Ok(Arc::new(resolved.collection))
    }

    /// Provision now and wait for index reconciliation
    pub async fn pre_heat(&self) -> Result<()> {
        self.handle(Access::Read).await.map(|_| ())
    }

    /// Drop the backing collection; the next access provisions it again
    pub async fn drop_collection(&self) -> Result<()> {
        let previous = {
            let mut cell = self.cell.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *cell, Arc::new(OnceCell::new()))
        };
        if let Some(resolved) = previous.get() {
            resolved.reconciled.clone().await;
        }

        let collection =
            MonitoredCollection::new(self.engine.collection(&self.name), Arc::clone(&self.health));
        collection.drop_collection().await?;
        tracing::info!(collection = %self.name, "collection dropped");
        Ok(())
    }

    fn current_cell(&self) -> Arc<OnceCell<Resolved>> {
        Arc::clone(&self.cell.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn resolve(&self) -> Result<Resolved> {
        let cell = self.current_cell();
        let resolved = cell
            .get_or_try_init(|| async {
                let raw = self
                    .dialect
                    .ensure_collection(self.engine.as_ref(), &self.name)
                    .await
                    .map_err(|e| {
                        self.health.record_failure(&e.kind);
                        e
                    })?;
                let collection = MonitoredCollection::new(raw, Arc::clone(&self.health));
                let descriptor = self
                    .descriptor
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();

                let reconciled = reconcile(
                    collection.clone(),
                    descriptor,
                    Arc::clone(&self.health),
                )
                .boxed()
                .shared();
                tokio::spawn(reconciled.clone());

                Ok::<_, DatabaseError>(Resolved {
                    collection,
                    reconciled,
                })
            })
            .await?;
        Ok(resolved.clone())
    }
}

async fn reconcile(
    collection: MonitoredCollection,
    descriptor: CollectionDescriptor,
    health: Arc<HealthMonitor>,
) {
    let name = descriptor.name();
    let declared = descriptor.indexes();

    let existing = match collection.indexes().await {
        Ok(existing) => existing,
        Err(err) => {
            tracing::warn!(collection = name, error = %err, "cannot list indexes");
            Vec::new()
        }
    };
    let was_empty = matches!(collection.count(&Filter::All).await, Ok(0));

    let drops = existing
        .iter()
        .filter(|e| {
            e.name != PRIMARY_INDEX && e.name != "_id" && !declared.iter().any(|d| d.name == e.name)
        })
        .map(|e| {
            let collection = &collection;
            async move {
                tracing::info!(collection = name, index = %e.name, "dropping index");
                if let Err(err) = collection.drop_index(&e.name).await {
                    tracing::error!(collection = name, index = %e.name, error = %err, "dropping index failed");
                }
            }
        });
    join_all(drops).await;

    let creates = declared
        .iter()
        .filter(|d| !existing.iter().any(|e| e.name == d.name))
        .map(|spec| {
            let collection = &collection;
            let health = &health;
            async move {
                match collection.create_index(spec).await {
                    Ok(()) => {
                        tracing::debug!(collection = name, index = %spec.name, "index created");
                        true
                    }
                    Err(err) => {
                        tracing::error!(collection = name, index = %spec.name, error = %err, "failed to create index");
                        if spec.unique {
                            health.mark_unique_unavailable(name);
                        }
                        if spec.is_text() {
                            health.mark_text_search_unavailable(name);
                        }
                        false
                    }
                }
            }
        });
    let created = join_all(creates).await.into_iter().any(|ok| ok);

    if created || was_empty {
        for fixture in descriptor.fixtures() {
            match collection.insert_one(fixture.clone()).await {
                Ok(_) => {}
                Err(err) if err.is_duplicate_key() => {}
                Err(err) => {
                    tracing::error!(collection = name, error = %err, "failed to insert fixture");
                }
            }
        }
    }
}
