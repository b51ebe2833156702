//! Conversation state storage
//!
//! One record per `(senderId, pageId)` holds the conversation state, a lock
//! timestamp and the time of the last interaction. Message processing takes
//! the lock with [`StateStorage::get_or_create_and_lock`] and releases it with
//! [`StateStorage::save_state`].
//!
//! # Locking
//!
//! The lock is a millisecond timestamp. A record can be locked when its lock
//! is at least `timeout` old; a released lock is `0`. Taking the lock is a
//! single conditional upsert, so of several concurrent callers exactly one
//! succeeds and the others get [`Error::Conflict`].
//!
//! # Degraded mode
//!
//! When the backend refused the unique `(senderId, pageId)` index, a locked
//! record no longer blocks the upsert and a duplicate gets inserted instead.
//! After every fresh insert the storage looks for such duplicates, removes the
//! ones it can attribute to the race and reports a conflict. This cleanup is
//! not atomic.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::config::StateConfig;
use crate::document::{
    from_document, to_document, Document, DocumentEngine, Filter, FindOneAndUpdateOptions,
    FindOptions, IndexSpec, OrderDirection, Projection, Update, ID_FIELD,
};
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::pagination::{decode_cursor, encode_cursor, Page};
use crate::provision::{Access, CollectionDescriptor, Dialect, ProvisionedCollection};

/// Unique index over the conversation key
pub const USER_INDEX: &str = "senderId_1_pageId_1";
/// Index used to order listings
pub const LAST_INTERACTION_INDEX: &str = "lastInteraction_1";
/// Prefix search index on restricted backends
pub const NAME_INDEX: &str = "name_1";
/// Full-text index on standard backends
pub const SEARCH_INDEX: &str = "search-text";

/// Fields never returned by listings
const HIDDEN_IN_LISTINGS: &[&str] = &[ID_FIELD, "lock", "off", "lastSendError", "score"];

/// Stored conversation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    /// Chat user
    pub sender_id: String,
    /// Channel or page the user talks to
    pub page_id: String,
    /// Application state
    #[serde(default)]
    pub state: Value,
    /// Lock timestamp in epoch milliseconds, `0` when released
    #[serde(default)]
    pub lock: i64,
    /// Last interaction in epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_interaction: Option<i64>,
    /// Conversation switched off
    #[serde(default)]
    pub off: bool,
    /// Last delivery failure
    #[serde(default)]
    pub last_send_error: Option<Value>,
    /// Display name, used by searches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Any other stored field
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StateRecord {
    /// Fresh record with an empty state
    pub fn new(sender_id: impl Into<String>, page_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            page_id: page_id.into(),
            state: Value::Object(Map::new()),
            lock: 0,
            last_interaction: None,
            off: false,
            last_send_error: None,
            name: None,
            extra: Map::new(),
        }
    }

    /// Stamp the last interaction
    pub fn touch(&mut self, at_ms: i64) {
        self.last_interaction = Some(at_ms);
    }

    fn has_interacted(&self) -> bool {
        self.last_interaction.is_some_and(|t| t != 0)
    }
}

/// Criteria for [`StateStorage::get_states`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateFilter {
    /// Search term over the sender id and the display name
    pub search: Option<String>,
}

impl StateFilter {
    /// Filter matching a search term
    pub fn search(term: impl Into<String>) -> Self {
        Self {
            search: Some(term.into()),
        }
    }
}

/// Position in a state listing
///
/// Plain listings continue below a `lastInteraction` watermark, so the entry
/// at the boundary may be returned again when several share the timestamp.
/// Searches continue by offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value")]
pub enum StateCursor {
    /// Entries with `lastInteraction` at or below the watermark
    #[serde(rename = "watermark")]
    ByWatermark(i64),
    /// Entries after skipping this many
    #[serde(rename = "skip")]
    BySkip(u64),
}

/// State storage over a provisioned collection
#[derive(Debug)]
pub struct StateStorage {
    collection: ProvisionedCollection,
    config: StateConfig,
}

impl StateStorage {
    /// State storage in `config.collection`
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        dialect: Dialect,
        health: Arc<HealthMonitor>,
        config: StateConfig,
    ) -> Result<Self> {
        let mut descriptor = CollectionDescriptor::new(config.collection.clone())
            .index(
                IndexSpec::new(USER_INDEX)
                    .asc("senderId")
                    .asc("pageId")
                    .unique(),
            )?
            .index(match dialect.sort_direction_for_index() {
                OrderDirection::Ascending => IndexSpec::new(LAST_INTERACTION_INDEX).asc("lastInteraction"),
                OrderDirection::Descending => IndexSpec::new(LAST_INTERACTION_INDEX).desc("lastInteraction"),
            })?;
        match dialect {
            Dialect::Restricted => descriptor.add_index(IndexSpec::new(NAME_INDEX).asc("name"))?,
            Dialect::Standard => descriptor.add_index(IndexSpec::text_wildcard(SEARCH_INDEX))?,
        }

        Ok(Self {
            collection: ProvisionedCollection::new(engine, dialect, health, descriptor),
            config,
        })
    }

    /// The underlying collection
    pub fn collection(&self) -> &ProvisionedCollection {
        &self.collection
    }

    /// Declare an additional index; call before first use
    pub fn add_custom_index(&self, spec: IndexSpec) -> Result<()> {
        self.collection.add_index(spec)
    }

    /// Provision the collection and wait for its indexes
    pub async fn pre_heat(&self) -> Result<()> {
        self.collection.pre_heat().await
    }

    /// Load or create the record for a conversation and lock it
    ///
    /// Fails with [`Error::Conflict`] when the record is locked and the lock
    /// is younger than `timeout_ms` (the configured default when `None`).
    pub async fn get_or_create_and_lock(
        &self,
        sender_id: &str,
        page_id: &str,
        default_state: Value,
        timeout_ms: Option<i64>,
    ) -> Result<StateRecord> {
        let timeout = timeout_ms.unwrap_or(self.config.lock_timeout_ms);
        let now = chrono::Utc::now().timestamp_millis();
        let stale_before = now - timeout;

        // the unique-index flag is only known once reconciliation finished
        let collection = self.collection.handle(Access::Read).await?;
        let degraded = self.collection.unique_unavailable();
        let filter = key_filter(sender_id, page_id).and(Filter::lte("lock", stale_before));
        let update = Update::new()
            .set_on_insert("state", default_state)
            .set_on_insert("lastSendError", Value::Null)
            .set_on_insert("off", false)
            .set("lock", now);
        let mut options = FindOneAndUpdateOptions::new()
            .upsert()
            .projection(Projection::exclude([ID_FIELD]));
        if degraded {
            options = options.sort("lastInteraction", OrderDirection::Descending);
        }

        let doc = match collection.find_one_and_update(&filter, &update, &options).await {
            Ok(Some(doc)) => doc,
            Ok(None) => return Err(Error::conflict("State was locked")),
            Err(e) if e.is_duplicate_key() => {
                debug!(sender_id, page_id, "state is locked");
                return Err(Error::conflict("State was locked"));
            }
            Err(e) => return Err(e.into()),
        };
        let record: StateRecord = from_document(doc)?;

        if degraded && !record.has_interacted() {
            self.resolve_duplicates(sender_id, page_id, now, stale_before)
                .await?;
        }
        Ok(record)
    }

    async fn resolve_duplicates(
        &self,
        sender_id: &str,
        page_id: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<()> {
        let collection = self.collection.handle(Access::Write).await?;
        let existing = collection
            .find(
                &key_filter(sender_id, page_id),
                &FindOptions::new().sort("lastInteraction", OrderDirection::Descending),
            )
            .await?;
        if existing.len() <= 1 {
            debug!(sender_id, page_id, "unique index workaround OK");
            return Ok(());
        }

        let doomed: Vec<Value> = existing
            .iter()
            .filter(|doc| is_race_duplicate(doc, now, stale_before))
            .filter_map(|doc| doc.get(ID_FIELD).cloned())
            .collect();
        if self.config.log_collisions_as_errors {
            error!(sender_id, page_id, duplicates = doomed.len(), "unique index workaround DETECTED");
        } else {
            warn!(sender_id, page_id, duplicates = doomed.len(), "unique index workaround DETECTED");
        }
        if !doomed.is_empty() {
            collection
                .delete_many(&Filter::in_values(ID_FIELD, doomed))
                .await?;
        }
        Err(Error::conflict("State was locked"))
    }

    /// The record for a conversation, without locking it
    pub async fn get_state(&self, sender_id: &str, page_id: &str) -> Result<Option<StateRecord>> {
        let collection = self.collection.handle(Access::Read).await?;
        let mut options = FindOptions::new().projection(Projection::exclude([ID_FIELD]));
        if self.collection.unique_unavailable() {
            options = options.sort("lastInteraction", OrderDirection::Descending);
        }
        collection
            .find_one(&key_filter(sender_id, page_id), &options)
            .await?
            .map(from_document)
            .transpose()
    }

    /// Store a record and release its lock
    pub async fn save_state(&self, mut record: StateRecord) -> Result<StateRecord> {
        record.lock = 0;
        let mut fields = to_document(&record)?;
        fields.remove(ID_FIELD);

        let collection = self.collection.handle(Access::Read).await?;
        let filter = key_filter(&record.sender_id, &record.page_id);
        let update = Update::new().set_all(fields);

        if self.collection.unique_unavailable() {
            let options = FindOneAndUpdateOptions::new()
                .upsert()
                .sort("lastInteraction", OrderDirection::Descending);
            collection
                .find_one_and_update(&filter, &update, &options)
                .await?;
        } else {
            collection.update_one(&filter, &update, true).await?;
        }
        Ok(record)
    }

    /// List records, most recent interaction first
    ///
    /// With a search term, matches sender ids and names: full-text where the
    /// backend supports it, by prefix otherwise.
    pub async fn get_states(
        &self,
        filter: &StateFilter,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page<StateRecord>> {
        let limit = limit.unwrap_or(self.config.page_size).max(1);
        let cursor: Option<StateCursor> = cursor.map(decode_cursor).transpose()?;
        let skip = match cursor {
            Some(StateCursor::BySkip(skip)) => skip,
            _ => 0,
        };

        let search = filter.search.as_deref().filter(|term| !term.is_empty());
        let mut query = Filter::All;
        let mut options = FindOptions::new().limit(limit as u64 + 1).skip(skip);
        match search {
            Some(term) => {
                query = self
                    .collection
                    .dialect()
                    .search_filter(term, self.collection.text_search_available());
                if query.has_text() {
                    options = options.sort_by_text_score();
                }
            }
            None => {
                if let Some(StateCursor::ByWatermark(watermark)) = cursor {
                    query = Filter::lte("lastInteraction", watermark);
                }
            }
        }
        options = options.sort("lastInteraction", OrderDirection::Descending);

        let collection = self.collection.handle(Access::Read).await?;
        let mut docs = collection.find(&query, &options).await?;

        let mut next = None;
        if docs.len() > limit {
            next = Some(match search {
                Some(_) => StateCursor::BySkip(skip + limit as u64),
                None => StateCursor::ByWatermark(
                    docs.last()
                        .and_then(|doc| doc.get("lastInteraction"))
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                ),
            });
            docs.truncate(limit);
        }

        let data = docs
            .into_iter()
            .map(|mut doc| {
                for field in HIDDEN_IN_LISTINGS {
                    doc.remove(*field);
                }
                from_document(doc)
            })
            .collect::<Result<Vec<StateRecord>>>()?;

        Ok(Page {
            data,
            next_cursor: next.as_ref().map(encode_cursor).transpose()?,
        })
    }

    /// Drop the collection; the next access provisions it again
    pub async fn drop_collection(&self) -> Result<()> {
        self.collection.drop_collection().await
    }
}

fn key_filter(sender_id: &str, page_id: &str) -> Filter {
    Filter::eq("senderId", sender_id).and(Filter::eq("pageId", page_id))
}

/// A record inserted by a lost race: never interacted, and locked by us or
/// holding an expired lock
fn is_race_duplicate(doc: &Document, now: i64, stale_before: i64) -> bool {
    let interacted = doc
        .get("lastInteraction")
        .and_then(Value::as_i64)
        .is_some_and(|t| t != 0);
    let lock = doc.get("lock").and_then(Value::as_i64).unwrap_or(0);
    !interacted && (lock == now || lock <= stale_before)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Capabilities, MemoryEngine};
    use serde_json::json;

    fn storage_on(engine: MemoryEngine, dialect: Dialect) -> StateStorage {
        StateStorage::new(
            Arc::new(engine),
            dialect,
            Arc::new(HealthMonitor::noop()),
            StateConfig::default(),
        )
        .unwrap()
    }

    fn storage() -> StateStorage {
        storage_on(MemoryEngine::new(), Dialect::Standard)
    }

    async fn count(storage: &StateStorage) -> u64 {
        storage
            .collection()
            .handle(Access::Write)
            .await
            .unwrap()
            .count(&Filter::All)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn creates_with_default_state_and_locks() {
        let storage = storage();
        storage.pre_heat().await.unwrap();

        let record = storage
            .get_or_create_and_lock("s1", "p1", json!({ "step": 1 }), Some(10_000))
            .await
            .unwrap();
        assert_eq!(record.state, json!({ "step": 1 }));
        assert!(record.lock > 0);
        assert!(!record.off);
        assert!(!record.extra.contains_key(ID_FIELD));

        let err = storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(10_000))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.code(), Some(11000));
        assert_eq!(count(&storage).await, 1);
    }

    #[tokio::test]
    async fn zero_timeout_lock_is_immediately_stale() {
        let storage = storage();
        storage.pre_heat().await.unwrap();

        storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(0))
            .await
            .unwrap();
        storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(0))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_releases_the_lock_and_keeps_state() {
        let storage = storage();
        storage.pre_heat().await.unwrap();

        let mut record = storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
            .await
            .unwrap();
        record.state = json!({ "step": 2 });
        record.touch(1_000);
        let saved = storage.save_state(record).await.unwrap();
        assert_eq!(saved.lock, 0);

        let relocked = storage
            .get_or_create_and_lock("s1", "p1", json!({ "step": 0 }), Some(60_000))
            .await
            .unwrap();
        assert_eq!(relocked.state, json!({ "step": 2 }));
        assert_eq!(relocked.last_interaction, Some(1_000));

        let loaded = storage.get_state("s1", "p1").await.unwrap().unwrap();
        assert_eq!(loaded.lock, relocked.lock);
        assert!(storage.get_state("s1", "other").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_lockers_have_one_winner() {
        let storage = Arc::new(storage());
        storage.pre_heat().await.unwrap();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                tokio::spawn(async move {
                    storage
                        .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
                        .await
                })
            })
            .collect();

        let mut won = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => won += 1,
                Err(e) => assert!(e.is_conflict()),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(count(&storage).await, 1);
    }

    #[tokio::test]
    async fn degraded_mode_removes_race_duplicates() {
        let storage = storage_on(
            MemoryEngine::with_capabilities(Capabilities::restricted()),
            Dialect::Restricted,
        );
        storage.pre_heat().await.unwrap();
        assert!(storage.collection().unique_unavailable());

        let mut record = storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
            .await
            .unwrap();
        record.touch(1_000);
        storage.save_state(record).await.unwrap();
        storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
            .await
            .unwrap();

        // the record is locked, so the upsert inserts a duplicate
        let err = storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(count(&storage).await, 1);

        let survivor = storage.get_state("s1", "p1").await.unwrap().unwrap();
        assert_eq!(survivor.last_interaction, Some(1_000));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn first_lockers_on_a_cold_degraded_backend_see_the_flag() {
        for _ in 0..16 {
            let storage = Arc::new(storage_on(
                MemoryEngine::with_capabilities(Capabilities::restricted()),
                Dialect::Restricted,
            ));

            let tasks: Vec<_> = (0..2)
                .map(|_| {
                    let storage = Arc::clone(&storage);
                    tokio::spawn(async move {
                        storage
                            .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
                            .await
                    })
                })
                .collect();

            let mut won = 0;
            for task in tasks {
                match task.await.unwrap() {
                    Ok(_) => won += 1,
                    Err(e) => assert!(e.is_conflict()),
                }
            }
            assert!(storage.collection().unique_unavailable());
            assert!(won <= 1);
            assert!(count(&storage).await <= 1);
        }
    }

    #[tokio::test]
    async fn degraded_cleanup_can_remove_the_winner_too() {
        let storage = storage_on(
            MemoryEngine::with_capabilities(Capabilities::restricted()),
            Dialect::Restricted,
        );
        storage.pre_heat().await.unwrap();

        // two racing creators left records that never interacted
        let collection = storage.collection().handle(Access::Write).await.unwrap();
        for _ in 0..2 {
            collection
                .insert_one(to_document(&StateRecord::new("s1", "p1")).unwrap())
                .await
                .unwrap();
        }

        let err = storage
            .get_or_create_and_lock("s1", "p1", json!({}), Some(60_000))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(count(&storage).await, 0);
    }

    async fn seed(storage: &StateStorage, sender: &str, name: &str, at: i64) {
        let mut record = StateRecord::new(sender, "p1");
        record.name = Some(name.to_string());
        record.touch(at);
        storage.save_state(record).await.unwrap();
    }

    #[tokio::test]
    async fn listing_pages_by_watermark() {
        let storage = storage();
        for (i, sender) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            seed(&storage, sender, sender, i as i64 + 1).await;
        }

        let first = storage
            .get_states(&StateFilter::default(), Some(2), None)
            .await
            .unwrap();
        let senders: Vec<_> = first.data.iter().map(|r| r.sender_id.as_str()).collect();
        assert_eq!(senders, ["e", "d"]);
        assert!(first.data.iter().all(|r| r.extra.get("score").is_none()));

        let second = storage
            .get_states(&StateFilter::default(), Some(2), first.next_cursor.as_deref())
            .await
            .unwrap();
        let senders: Vec<_> = second.data.iter().map(|r| r.sender_id.as_str()).collect();
        assert_eq!(senders, ["c", "b"]);

        let third = storage
            .get_states(&StateFilter::default(), Some(2), second.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(third.data.len(), 1);
        assert!(!third.has_next());
    }

    #[tokio::test]
    async fn standard_search_is_full_text() {
        let storage = storage();
        seed(&storage, "u1", "Jane Doe", 1).await;
        seed(&storage, "u2", "John Smith", 2).await;
        seed(&storage, "u3", "Jane Roe", 3).await;

        let page = storage
            .get_states(&StateFilter::search("jane"), Some(1), None)
            .await
            .unwrap();
        assert_eq!(page.data.len(), 1);
        let next = storage
            .get_states(&StateFilter::search("jane"), Some(1), page.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(next.data.len(), 1);
        assert!(!next.has_next());

        let mut found = vec![page.data[0].sender_id.clone(), next.data[0].sender_id.clone()];
        found.sort();
        assert_eq!(found, ["u1", "u3"]);
    }

    #[tokio::test]
    async fn restricted_search_matches_prefixes() {
        let storage = storage_on(
            MemoryEngine::with_capabilities(Capabilities::restricted()),
            Dialect::Restricted,
        );
        seed(&storage, "u1", "Jane Doe", 1).await;
        seed(&storage, "jan-2", "Bob", 2).await;
        seed(&storage, "u3", "Alice", 3).await;
        seed(&storage, "u4", "jane lower", 4).await;

        let page = storage
            .get_states(&StateFilter::search("Jan"), None, None)
            .await
            .unwrap();
        let senders: Vec<_> = page.data.iter().map(|r| r.sender_id.as_str()).collect();
        assert_eq!(senders, ["u1"]);

        let page = storage
            .get_states(&StateFilter::search("jan"), None, None)
            .await
            .unwrap();
        let senders: Vec<_> = page.data.iter().map(|r| r.sender_id.as_str()).collect();
        assert_eq!(senders, ["u4", "jan-2"]);
    }

    #[tokio::test]
    async fn invalid_cursor_is_rejected() {
        let storage = storage();
        let err = storage
            .get_states(&StateFilter::default(), None, Some("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cursor(_)));
    }

    #[test]
    fn cursor_serialization_is_tagged() {
        assert_eq!(
            serde_json::to_value(StateCursor::ByWatermark(5)).unwrap(),
            json!({ "by": "watermark", "value": 5 })
        );
        assert_eq!(
            serde_json::to_value(StateCursor::BySkip(40)).unwrap(),
            json!({ "by": "skip", "value": 40 })
        );
    }
}
