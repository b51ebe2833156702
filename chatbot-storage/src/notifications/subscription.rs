//! Tag subscriptions

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{without_database_id, NotificationsStorage, BATCH_SIZE};
use crate::document::{
    from_document, Filter, FindOneAndUpdateOptions, FindOptions, OrderDirection, Projection,
    Update, UpdateOne, ID_FIELD,
};
use crate::error::Result;
use crate::pagination::{decode_cursor, encode_cursor, Page};
use crate::provision::Access;

/// One change of a recipient's tags
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    /// Recipient's page
    pub page_id: String,
    /// Recipient
    pub sender_id: String,
    /// Tags to add or remove
    pub tags: Vec<String>,
    /// Metadata per tag, merged into the stored metadata
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Remove the tags instead of adding them
    #[serde(default)]
    pub remove: bool,
}

impl SubscriptionData {
    /// Add `tags` to a recipient
    pub fn add(
        sender_id: impl Into<String>,
        page_id: impl Into<String>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            page_id: page_id.into(),
            sender_id: sender_id.into(),
            tags: tags.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Remove `tags` from a recipient
    pub fn remove(
        sender_id: impl Into<String>,
        page_id: impl Into<String>,
        tags: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            remove: true,
            ..Self::add(sender_id, page_id, tags)
        }
    }

    /// Attach metadata to one of the tags
    pub fn with_meta(mut self, tag: impl Into<String>, meta: Value) -> Self {
        self.meta.insert(tag.into(), meta);
        self
    }

    fn into_operation(self, only_to_known: bool) -> UpdateOne {
        let mut update = Update::new();
        if self.remove {
            for tag in &self.tags {
                update = update.set(format!("meta.{}", tag), Value::Object(Map::new()));
            }
            update = update.pull_all("subs", self.tags);
        } else {
            for (tag, meta) in self.meta {
                update = update.set(format!("meta.{}", tag), meta);
            }
            update = update.add_to_set("subs", self.tags);
        }
        UpdateOne {
            filter: Filter::eq("senderId", self.sender_id).and(Filter::eq("pageId", self.page_id)),
            update,
            upsert: !self.remove && !only_to_known,
        }
    }
}

/// A subscribed recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionTarget {
    /// Recipient
    pub sender_id: String,
    /// Recipient's page
    pub page_id: String,
    /// Metadata of the requested tags
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Map<String, Value>>,
}

/// A tag a recipient is subscribed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagSubscription {
    /// Tag
    pub tag: String,
    /// Metadata stored with the tag
    pub meta: Value,
}

/// Number of subscribers of a tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    /// Tag
    pub tag: String,
    /// Subscribed recipients
    pub subscriptions: u64,
}

/// Position in a subscriber listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionCursor {
    /// Next page holds subscriptions stored after this database id
    pub after_id: String,
}

#[derive(Deserialize)]
struct StoredSubscription {
    #[serde(default)]
    subs: Vec<String>,
    #[serde(default)]
    meta: Map<String, Value>,
}

fn subscriptions_condition(include: &[String], exclude: &[String], page_id: Option<&str>) -> Filter {
    let mut conditions = Vec::new();
    if !include.is_empty() {
        conditions.push(Filter::in_values("subs", include.iter().map(String::as_str)));
    }
    if !exclude.is_empty() {
        conditions.push(Filter::not_in("subs", exclude.iter().map(String::as_str)));
    }
    if let Some(page_id) = page_id {
        conditions.push(Filter::eq("pageId", page_id));
    }
    conditions
        .into_iter()
        .fold(Filter::All, |filter, condition| filter.and(condition))
}

fn recipient(sender_id: &str, page_id: &str) -> Filter {
    Filter::eq("senderId", sender_id).and(Filter::eq("pageId", page_id))
}

impl NotificationsStorage {
    /// Apply tag changes to many recipients
    ///
    /// Entries without tags are skipped. Additions create missing
    /// subscriptions unless `only_to_known` is set, in which case write
    /// errors are only logged. Subscriptions left without tags are deleted.
    pub async fn batch_subscribe(
        &self,
        data: Vec<SubscriptionData>,
        only_to_known: bool,
    ) -> Result<()> {
        let pending: Vec<SubscriptionData> =
            data.into_iter().filter(|entry| !entry.tags.is_empty()).collect();
        if pending.is_empty() {
            return Ok(());
        }
        let collection = self.subscriptions.handle(Access::Write).await?;

        for chunk in pending.chunks(BATCH_SIZE) {
            let emptied: Vec<&str> = chunk
                .iter()
                .filter(|entry| entry.remove)
                .map(|entry| entry.sender_id.as_str())
                .collect();
            let operations: Vec<UpdateOne> = chunk
                .iter()
                .cloned()
                .map(|entry| entry.into_operation(only_to_known))
                .collect();

            match collection.bulk_update(&operations, false).await {
                Ok(outcome) => {
                    tracing::debug!(
                        operations = operations.len(),
                        matched = outcome.matched,
                        created = outcome.upserted_ids.len(),
                        "subscriptions updated"
                    );
                }
                Err(e) if only_to_known => {
                    tracing::warn!(error = %e, "updating known subscriptions failed");
                }
                Err(e) => return Err(e.into()),
            }

            if !emptied.is_empty() {
                collection
                    .delete_many(&Filter::all_of(vec![
                        Filter::in_values("senderId", emptied),
                        Filter::eq("subs", Value::Array(Vec::new())),
                    ]))
                    .await?;
            }
        }
        Ok(())
    }

    /// Subscribe recipients of one page to a tag
    pub async fn subscribe(
        &self,
        sender_ids: &[String],
        page_id: &str,
        tag: &str,
        only_to_known: bool,
    ) -> Result<()> {
        let data = sender_ids
            .iter()
            .map(|sender_id| SubscriptionData::add(sender_id.as_str(), page_id, [tag]))
            .collect();
        self.batch_subscribe(data, only_to_known).await
    }

    /// Unsubscribe a recipient from one tag, or from everything when `tag` is `None`
    ///
    /// Returns the tags that were removed.
    pub async fn unsubscribe(
        &self,
        sender_id: &str,
        page_id: &str,
        tag: Option<&str>,
    ) -> Result<Vec<String>> {
        let collection = self.subscriptions.handle(Access::Write).await?;
        let mut removed = Vec::new();

        let remove_all = match tag {
            None => true,
            Some(tag) => {
                let updated = collection
                    .find_one_and_update(
                        &recipient(sender_id, page_id).and(Filter::eq("subs", tag)),
                        &Update::new().pull("subs", tag),
                        &FindOneAndUpdateOptions::new(),
                    )
                    .await?;
                let Some(updated) = updated else {
                    return Ok(removed);
                };
                removed.push(tag.to_string());
                let remaining: StoredSubscription = from_document(updated)?;
                remaining.subs.is_empty()
            }
        };

        if remove_all {
            if let Some(deleted) = collection
                .find_one_and_delete(&recipient(sender_id, page_id))
                .await?
            {
                let deleted: StoredSubscription = from_document(deleted)?;
                removed.extend(deleted.subs);
            }
        }
        Ok(removed)
    }

    /// Number of recipients matching the tag condition
    pub async fn get_subscriptions_count(
        &self,
        include: &[String],
        exclude: &[String],
        page_id: Option<&str>,
    ) -> Result<u64> {
        let collection = self.subscriptions.handle(Access::Read).await?;
        Ok(collection
            .count(&subscriptions_condition(include, exclude, page_id))
            .await?)
    }

    /// Recipients matching the tag condition, in storage order
    ///
    /// Recipients subscribed to any of `include` and none of `exclude`
    /// match. An empty `include` matches every tag. Only the metadata of the
    /// included tags is returned. Without `limit`, every match is returned
    /// in one page.
    pub async fn get_subscriptions(
        &self,
        include: &[String],
        exclude: &[String],
        limit: Option<usize>,
        page_id: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<Page<SubscriptionTarget>> {
        let mut condition = subscriptions_condition(include, exclude, page_id);
        if let Some(cursor) = cursor {
            let cursor: SubscriptionCursor = decode_cursor(cursor)?;
            condition = condition.and(Filter::gt(ID_FIELD, cursor.after_id));
        }

        let mut fields = vec!["pageId".to_string(), "senderId".to_string()];
        if include.is_empty() {
            fields.push("meta".to_string());
        } else {
            fields.extend(include.iter().map(|tag| format!("meta.{}", tag)));
        }
        let options = FindOptions::new()
            .projection(Projection::include(fields))
            .sort(ID_FIELD, OrderDirection::Ascending);

        let total = limit.map_or(usize::MAX - 1, |limit| limit.max(1));
        let chunk = (total + 1).min(BATCH_SIZE) as u64;
        let collection = self.subscriptions.handle(Access::Read).await?;

        let mut docs = Vec::new();
        let mut skip = 0;
        loop {
            let found = collection
                .find(&condition, &options.clone().skip(skip).limit(chunk))
                .await?;
            let fetched = found.len() as u64;
            docs.extend(found);
            if fetched < chunk || docs.len() > total {
                break;
            }
            skip += fetched;
        }

        let mut next_cursor = None;
        if docs.len() > total {
            docs.truncate(total);
            if let Some(id) = docs.last().and_then(|doc| doc.get(ID_FIELD)).and_then(Value::as_str) {
                next_cursor = Some(encode_cursor(&SubscriptionCursor {
                    after_id: id.to_string(),
                })?);
            }
        }

        let data = docs
            .into_iter()
            .map(|doc| from_document(without_database_id(doc)))
            .collect::<Result<_>>()?;
        Ok(Page { data, next_cursor })
    }

    /// Tags of a recipient with their metadata
    pub async fn get_sender_subscriptions(
        &self,
        sender_id: &str,
        page_id: &str,
    ) -> Result<Vec<TagSubscription>> {
        let collection = self.subscriptions.handle(Access::Read).await?;
        let found = collection
            .find_one(
                &recipient(sender_id, page_id),
                &FindOptions::new().projection(Projection::include(["subs", "meta"]).without_id()),
            )
            .await?;
        let Some(found) = found else {
            return Ok(Vec::new());
        };

        let StoredSubscription { subs, mut meta } = from_document(found)?;
        Ok(subs
            .into_iter()
            .map(|tag| {
                let meta = meta
                    .remove(&tag)
                    .filter(|m| !m.is_null())
                    .unwrap_or_else(|| Value::Object(Map::new()));
                TagSubscription { tag, meta }
            })
            .collect())
    }

    /// Tags of a recipient
    pub async fn get_sender_subscription_tags(
        &self,
        sender_id: &str,
        page_id: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .get_sender_subscriptions(sender_id, page_id)
            .await?
            .into_iter()
            .map(|s| s.tag)
            .collect())
    }

    /// Subscriber count of every tag, most popular first
    pub async fn get_tags(&self, page_id: Option<&str>) -> Result<Vec<TagCount>> {
        let collection = self.subscriptions.handle(Access::Read).await?;
        let filter = page_id.map_or(Filter::All, |page_id| Filter::eq("pageId", page_id));
        let groups = collection.group_count(&filter, "subs").await?;
        Ok(groups
            .into_iter()
            .filter_map(|(tag, subscriptions)| {
                tag.as_str().map(|tag| TagCount {
                    tag: tag.to_string(),
                    subscriptions,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::storage;
    use super::*;
    use serde_json::json;

    fn ids(senders: &[&str]) -> Vec<String> {
        senders.iter().map(|s| s.to_string()).collect()
    }

    fn tags(t: &[&str]) -> Vec<String> {
        t.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn subscribe_and_list_tags() {
        let storage = storage();
        storage.subscribe(&ids(&["s1", "s2"]), "p1", "news", false).await.unwrap();
        storage.subscribe(&ids(&["s1"]), "p1", "deals", false).await.unwrap();
        storage.subscribe(&ids(&["s3"]), "p2", "news", false).await.unwrap();

        assert_eq!(
            storage.get_sender_subscription_tags("s1", "p1").await.unwrap(),
            ["news", "deals"]
        );
        assert_eq!(
            storage.get_tags(None).await.unwrap(),
            [
                TagCount {
                    tag: "news".into(),
                    subscriptions: 3
                },
                TagCount {
                    tag: "deals".into(),
                    subscriptions: 1
                }
            ]
        );
        let on_p2 = storage.get_tags(Some("p2")).await.unwrap();
        assert_eq!(on_p2.len(), 1);
        assert_eq!(on_p2[0].subscriptions, 1);
    }

    #[tokio::test]
    async fn only_to_known_does_not_create() {
        let storage = storage();
        storage.subscribe(&ids(&["s1"]), "p1", "news", true).await.unwrap();
        assert!(storage.get_sender_subscriptions("s1", "p1").await.unwrap().is_empty());

        storage.subscribe(&ids(&["s1"]), "p1", "news", false).await.unwrap();
        storage.subscribe(&ids(&["s1"]), "p1", "deals", true).await.unwrap();
        assert_eq!(
            storage.get_sender_subscription_tags("s1", "p1").await.unwrap(),
            ["news", "deals"]
        );
    }

    #[tokio::test]
    async fn batch_metadata_and_removal() {
        let storage = storage();
        storage
            .batch_subscribe(
                vec![
                    SubscriptionData::add("s1", "p1", ["news", "deals"])
                        .with_meta("news", json!({ "lang": "en" })),
                    SubscriptionData::add("s2", "p1", Vec::<String>::new()),
                ],
                false,
            )
            .await
            .unwrap();

        let subs = storage.get_sender_subscriptions("s1", "p1").await.unwrap();
        assert_eq!(
            subs,
            [
                TagSubscription {
                    tag: "news".into(),
                    meta: json!({ "lang": "en" })
                },
                TagSubscription {
                    tag: "deals".into(),
                    meta: json!({})
                }
            ]
        );
        assert_eq!(storage.get_subscriptions_count(&[], &[], None).await.unwrap(), 1);

        storage
            .batch_subscribe(vec![SubscriptionData::remove("s1", "p1", ["news"])], false)
            .await
            .unwrap();
        let subs = storage.get_sender_subscriptions("s1", "p1").await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].tag, "deals");

        storage
            .batch_subscribe(vec![SubscriptionData::remove("s1", "p1", ["deals"])], false)
            .await
            .unwrap();
        assert_eq!(storage.get_subscriptions_count(&[], &[], None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_returns_removed_tags() {
        let storage = storage();
        storage
            .batch_subscribe(vec![SubscriptionData::add("s1", "p1", ["a", "b"])], false)
            .await
            .unwrap();

        assert!(storage.unsubscribe("s1", "p1", Some("x")).await.unwrap().is_empty());
        assert_eq!(storage.unsubscribe("s1", "p1", Some("a")).await.unwrap(), ["a"]);
        // last tag takes the whole subscription with it
        assert_eq!(storage.unsubscribe("s1", "p1", Some("b")).await.unwrap(), ["b"]);
        assert_eq!(storage.get_subscriptions_count(&[], &[], None).await.unwrap(), 0);

        storage
            .batch_subscribe(vec![SubscriptionData::add("s2", "p1", ["a", "b"])], false)
            .await
            .unwrap();
        assert_eq!(storage.unsubscribe("s2", "p1", None).await.unwrap(), ["a", "b"]);
        assert!(storage.unsubscribe("s2", "p1", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_filters_and_pages() {
        let storage = storage();
        storage
            .batch_subscribe(
                vec![
                    SubscriptionData::add("s1", "p1", ["a"]).with_meta("a", json!({ "x": 1 })),
                    SubscriptionData::add("s2", "p1", ["a", "b"]),
                    SubscriptionData::add("s3", "p1", ["b"]),
                    SubscriptionData::add("s4", "p1", ["a"]),
                    SubscriptionData::add("s5", "p2", ["a"]),
                ],
                false,
            )
            .await
            .unwrap();

        assert_eq!(
            storage.get_subscriptions_count(&tags(&["a"]), &tags(&["b"]), Some("p1")).await.unwrap(),
            2
        );

        let first = storage
            .get_subscriptions(&tags(&["a"]), &[], Some(2), None, None)
            .await
            .unwrap();
        let senders: Vec<_> = first.data.iter().map(|t| t.sender_id.as_str()).collect();
        assert_eq!(senders, ["s1", "s2"]);
        assert_eq!(first.data[0].meta, Some(json!({ "a": { "x": 1 } }).as_object().unwrap().clone()));

        let second = storage
            .get_subscriptions(&tags(&["a"]), &[], Some(2), None, first.next_cursor.as_deref())
            .await
            .unwrap();
        let senders: Vec<_> = second.data.iter().map(|t| t.sender_id.as_str()).collect();
        assert_eq!(senders, ["s4", "s5"]);
        assert!(!second.has_next());

        // a zero limit still returns one row and a cursor
        let single = storage
            .get_subscriptions(&tags(&["a"]), &[], Some(0), None, None)
            .await
            .unwrap();
        assert_eq!(single.data.len(), 1);
        assert_eq!(single.data[0].sender_id, "s1");
        assert!(single.has_next());

        let everyone = storage.get_subscriptions(&[], &[], None, Some("p1"), None).await.unwrap();
        assert_eq!(everyone.data.len(), 4);
        assert!(everyone.next_cursor.is_none());
    }
}
