//! Notification campaigns, delivery tasks and tag subscriptions
//!
//! [`NotificationsStorage`] manages three collections sharing a prefix:
//!
//! - `notification-tasks`: one task per campaign and recipient, deduplicated
//!   by `(campaignId, senderId, pageId, sent)`
//! - `notification-campaigns`: campaigns keyed by their business id
//! - `notification-subscribtions`: the tags each recipient subscribed to
//!
//! # Task queue
//!
//! A task is due when its `enqueue` timestamp has passed. Popping claims the
//! earliest due task with one conditional update that moves `enqueue` to
//! [`MAX_TS`], so concurrent poppers never receive the same task. Delivery
//! and read receipts are applied only to tasks that do not carry them yet,
//! which makes replayed receipts harmless.

mod campaign;
mod subscription;
mod task;

pub use campaign::{Campaign, CampaignCursor};
pub use subscription::{
    SubscriptionCursor, SubscriptionData, SubscriptionTarget, TagCount, TagSubscription,
};
pub use task::{Task, TaskTarget, WatermarkEvent};

use std::sync::Arc;

use crate::document::{Document, DocumentEngine, IndexSpec, ID_FIELD};
use crate::error::Result;
use crate::health::HealthMonitor;
use crate::provision::{CollectionDescriptor, Dialect, ProvisionedCollection};

/// Enqueue timestamp of claimed tasks, later than any real one
pub const MAX_TS: i64 = 9_999_999_999_999;

/// Largest batch written in one request
pub(crate) const BATCH_SIZE: usize = 999;

/// Suffix of the tasks collection
pub const TASKS_COLLECTION: &str = "notification-tasks";
/// Suffix of the campaigns collection
pub const CAMPAIGNS_COLLECTION: &str = "notification-campaigns";
/// Suffix of the subscriptions collection
pub const SUBSCRIPTIONS_COLLECTION: &str = "notification-subscribtions";

/// Notification storage over three provisioned collections
#[derive(Debug)]
pub struct NotificationsStorage {
    tasks: ProvisionedCollection,
    campaigns: ProvisionedCollection,
    subscriptions: ProvisionedCollection,
    dialect: Dialect,
}

impl NotificationsStorage {
    /// Notification storage with collection names starting with `collection_prefix`
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        dialect: Dialect,
        health: Arc<HealthMonitor>,
        collection_prefix: &str,
    ) -> Result<Self> {
        let mut tasks = CollectionDescriptor::new(format!("{}{}", collection_prefix, TASKS_COLLECTION))
            .index(
                IndexSpec::new("pageId_1_senderId_1_campaignId_1_sent_-1")
                    .asc("pageId")
                    .asc("senderId")
                    .asc("campaignId")
                    .desc("sent")
                    .unique(),
            )?
            .index(IndexSpec::new("enqueue_1").asc("enqueue"))?
            .index(
                IndexSpec::new("pageId_1_senderId_1_sent_-1_read_1")
                    .asc("pageId")
                    .asc("senderId")
                    .desc("sent")
                    .asc("read"),
            )?
            .index(
                IndexSpec::new("pageId_1_senderId_1_sent_-1_delivery_1")
                    .asc("pageId")
                    .asc("senderId")
                    .desc("sent")
                    .asc("delivery"),
            )?
            .index(
                IndexSpec::new("campaignId_1_leaved_-1_reaction_-1")
                    .asc("campaignId")
                    .desc("leaved")
                    .desc("reaction"),
            )?;
        if dialect == Dialect::Restricted {
            tasks.add_index(IndexSpec::new("sent_1").asc("sent"))?;
        }

        let campaigns =
            CollectionDescriptor::new(format!("{}{}", collection_prefix, CAMPAIGNS_COLLECTION))
                .index(IndexSpec::new("id_1").asc("id").unique())?
                .index(IndexSpec::new("active_-1_startAt_-1").desc("active").desc("startAt"))?;

        let subscriptions =
            CollectionDescriptor::new(format!("{}{}", collection_prefix, SUBSCRIPTIONS_COLLECTION))
                .index(
                    IndexSpec::new("pageId_1_senderId_1")
                        .asc("pageId")
                        .asc("senderId")
                        .unique(),
                )?
                .index(IndexSpec::new("subs_1_pageId_1").asc("subs").asc("pageId"))?;

        Ok(Self {
            tasks: ProvisionedCollection::new(Arc::clone(&engine), dialect, Arc::clone(&health), tasks),
            campaigns: ProvisionedCollection::new(
                Arc::clone(&engine),
                dialect,
                Arc::clone(&health),
                campaigns,
            ),
            subscriptions: ProvisionedCollection::new(engine, dialect, health, subscriptions),
            dialect,
        })
    }

    /// The tasks collection
    pub fn tasks_collection(&self) -> &ProvisionedCollection {
        &self.tasks
    }

    /// The campaigns collection
    pub fn campaigns_collection(&self) -> &ProvisionedCollection {
        &self.campaigns
    }

    /// The subscriptions collection
    pub fn subscriptions_collection(&self) -> &ProvisionedCollection {
        &self.subscriptions
    }

    /// Provision all three collections and wait for their indexes
    pub async fn pre_heat(&self) -> Result<()> {
        futures::try_join!(
            self.tasks.pre_heat(),
            self.campaigns.pre_heat(),
            self.subscriptions.pre_heat()
        )?;
        Ok(())
    }

    /// Drop all three collections
    pub async fn drop_collections(&self) -> Result<()> {
        self.tasks.drop_collection().await?;
        self.campaigns.drop_collection().await?;
        self.subscriptions.drop_collection().await
    }
}

/// Move the database id to `id`
fn with_public_id(mut doc: Document) -> Document {
    if let Some(id) = doc.remove(ID_FIELD) {
        doc.insert("id".to_string(), id);
    }
    doc
}

fn without_database_id(mut doc: Document) -> Document {
    doc.remove(ID_FIELD);
    doc
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::document::MemoryEngine;

    pub fn storage() -> NotificationsStorage {
        storage_on(Arc::new(MemoryEngine::new()), Dialect::Standard)
    }

    pub fn storage_on(engine: Arc<MemoryEngine>, dialect: Dialect) -> NotificationsStorage {
        NotificationsStorage::new(engine, dialect, Arc::new(HealthMonitor::noop()), "")
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Capabilities, MemoryEngine};

    #[tokio::test]
    async fn provisions_all_collections_with_prefix() {
        let engine = Arc::new(MemoryEngine::new());
        let storage = NotificationsStorage::new(
            Arc::clone(&engine) as Arc<dyn DocumentEngine>,
            Dialect::Standard,
            Arc::new(HealthMonitor::noop()),
            "bot-",
        )
        .unwrap();
        storage.pre_heat().await.unwrap();

        assert_eq!(storage.tasks_collection().name(), "bot-notification-tasks");
        let indexes = engine
            .collection("bot-notification-tasks")
            .indexes()
            .await
            .unwrap();
        assert!(indexes.iter().any(|i| i.name == "enqueue_1"));
        assert!(!indexes.iter().any(|i| i.name == "sent_1"));
    }

    #[tokio::test]
    async fn restricted_dialect_adds_sent_index() {
        let engine = Arc::new(MemoryEngine::with_capabilities(Capabilities::restricted()));
        let storage = test_support::storage_on(Arc::clone(&engine), Dialect::Restricted);
        storage.pre_heat().await.unwrap();

        let collections = engine.list_collections().await.unwrap();
        assert_eq!(collections.len(), 3);
        let indexes = engine
            .collection("notification-tasks")
            .indexes()
            .await
            .unwrap();
        assert!(indexes.iter().any(|i| i.name == "sent_1"));
        assert!(storage.tasks_collection().unique_unavailable());
    }
}
