//! Campaigns

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{without_database_id, NotificationsStorage};
use crate::document::{
    from_document, to_document, Document, Filter, FindOneAndUpdateOptions, FindOptions,
    OrderDirection, Update, ID_FIELD,
};
use crate::error::Result;
use crate::pagination::{decode_cursor, encode_cursor, Page};
use crate::provision::Access;

/// A notification campaign
///
/// Counters default to zero so a freshly created campaign can be
/// incremented right away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    /// Business id, generated when empty
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Tags a recipient needs one of
    #[serde(default)]
    pub include: Vec<String>,
    /// Tags excluding a recipient
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Messages sent
    #[serde(default)]
    pub sent: i64,
    /// Messages that reached the recipient
    #[serde(default)]
    pub succeeded: i64,
    /// Messages that failed
    #[serde(default)]
    pub failed: i64,
    /// Recipients who unsubscribed in reaction
    #[serde(default)]
    pub unsubscribed: i64,
    /// Delivery receipts
    #[serde(default)]
    pub delivery: i64,
    /// Read receipts
    #[serde(default)]
    pub read: i64,
    /// Messages not sent
    #[serde(default)]
    pub not_sent: i64,
    /// Recipients who left before sending
    #[serde(default)]
    pub leaved: i64,
    /// Tasks queued
    #[serde(default)]
    pub queued: i64,
    /// Interaction to run for each recipient
    #[serde(default)]
    pub action: String,
    /// Data passed to the action
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Whether the campaign keeps sending to new recipients
    #[serde(default)]
    pub sliding: bool,
    /// Sliding interval in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide: Option<i64>,
    /// Sliding rounds done
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_round: Option<i64>,
    /// Whether the campaign may be started
    #[serde(default)]
    pub active: bool,
    /// Only send inside the 24 hour messaging window
    #[serde(default, rename = "in24hourWindow")]
    pub in_24_hour_window: bool,
    /// Scheduled start in epoch milliseconds, `None` once started
    #[serde(default)]
    pub start_at: Option<i64>,
    /// Any other campaign field
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Campaign {
    /// Empty campaign with a name and an action
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            sent: 0,
            succeeded: 0,
            failed: 0,
            unsubscribed: 0,
            delivery: 0,
            read: 0,
            not_sent: 0,
            leaved: 0,
            queued: 0,
            action: action.into(),
            data: Map::new(),
            sliding: false,
            slide: None,
            slide_round: None,
            active: false,
            in_24_hour_window: false,
            start_at: None,
            extra: Map::new(),
        }
    }
}

/// Position in a campaign listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignCursor {
    /// Next page holds campaigns stored before this database id
    pub before_id: String,
}

fn into_campaign(doc: Document) -> Result<Campaign> {
    from_document(without_database_id(doc))
}

impl NotificationsStorage {
    /// Create a campaign or update an existing one
    ///
    /// With an id, the campaign fields are written only when the campaign
    /// does not exist yet, while `update` is applied either way. Without an
    /// id, a new campaign is inserted with `update` merged in.
    pub async fn upsert_campaign(
        &self,
        campaign: Campaign,
        update: Option<Document>,
    ) -> Result<Campaign> {
        let collection = self.campaigns.handle(Access::Write).await?;
        let update = update.unwrap_or_default();

        if campaign.id.is_empty() {
            let mut campaign = campaign;
            campaign.id = uuid::Uuid::now_v7().simple().to_string();
            let mut doc = to_document(&campaign)?;
            doc.extend(update);
            collection.insert_one(doc.clone()).await?;
            tracing::debug!(campaign = %campaign.id, "campaign created");
            return from_document(doc);
        }

        let mut on_insert = to_document(&campaign)?;
        on_insert.remove("id");
        for key in update.keys() {
            on_insert.remove(key);
        }
        let found = collection
            .find_one_and_update(
                &Filter::eq("id", campaign.id.as_str()),
                &Update::new().set_on_insert_all(on_insert).set_all(update),
                &FindOneAndUpdateOptions::new().upsert(),
            )
            .await?;
        match found {
            Some(doc) => into_campaign(doc),
            None => Ok(campaign),
        }
    }

    /// Delete a campaign
    pub async fn remove_campaign(&self, campaign_id: &str) -> Result<()> {
        let collection = self.campaigns.handle(Access::Write).await?;
        collection.delete_one(&Filter::eq("id", campaign_id)).await?;
        Ok(())
    }

    /// Add to campaign counters
    pub async fn increment_campaign(&self, campaign_id: &str, increments: Map<String, Value>) -> Result<()> {
        if increments.is_empty() {
            return Ok(());
        }
        let collection = self.campaigns.handle(Access::Write).await?;
        let update = increments
            .into_iter()
            .fold(Update::new(), |update, (field, by)| update.inc(field, by));
        collection
            .update_one(&Filter::eq("id", campaign_id), &update, false)
            .await?;
        Ok(())
    }

    /// Set campaign fields, returning the updated campaign
    pub async fn update_campaign(&self, campaign_id: &str, data: Document) -> Result<Option<Campaign>> {
        let collection = self.campaigns.handle(Access::Write).await?;
        collection
            .find_one_and_update(
                &Filter::eq("id", campaign_id),
                &Update::new().set_all(data),
                &FindOneAndUpdateOptions::new(),
            )
            .await?
            .map(into_campaign)
            .transpose()
    }

    /// Claim one active campaign whose start time has passed
    ///
    /// The start time is cleared in the same update, so each scheduled
    /// start is claimed once. Returns the campaign as it was before the
    /// claim. `now` defaults to the current time.
    pub async fn pop_campaign(&self, now: Option<i64>) -> Result<Option<Campaign>> {
        let now = now.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let collection = self.campaigns.handle(Access::Write).await?;
        let filter = Filter::all_of(vec![
            Filter::is_not_null("startAt"),
            Filter::lte("startAt", now),
            Filter::eq("active", true),
        ]);
        collection
            .find_one_and_update(
                &filter,
                &Update::new().set("startAt", Value::Null),
                &FindOneAndUpdateOptions::new().return_before(),
            )
            .await?
            .map(into_campaign)
            .transpose()
    }

    /// A campaign by its business id
    pub async fn get_campaign_by_id(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let collection = self.campaigns.handle(Access::Read).await?;
        collection
            .find_one(&Filter::eq("id", campaign_id), &FindOptions::new())
            .await?
            .map(into_campaign)
            .transpose()
    }

    /// Campaigns by business ids, in no particular order
    pub async fn get_campaign_by_ids(&self, campaign_ids: &[String]) -> Result<Vec<Campaign>> {
        if campaign_ids.is_empty() {
            return Ok(Vec::new());
        }
        let collection = self.campaigns.handle(Access::Read).await?;
        collection
            .find(
                &Filter::in_values("id", campaign_ids.iter().map(String::as_str)),
                &FindOptions::new().limit(campaign_ids.len() as u64),
            )
            .await?
            .into_iter()
            .map(into_campaign)
            .collect()
    }

    /// Campaigns matching `filter`, newest first
    pub async fn get_campaigns(
        &self,
        filter: Filter,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<Page<Campaign>> {
        let limit = limit.unwrap_or(20);
        let mut filter = filter;
        if let Some(cursor) = cursor {
            let cursor: CampaignCursor = decode_cursor(cursor)?;
            filter = filter.and(Filter::lt(ID_FIELD, cursor.before_id));
        }

        let collection = self.campaigns.handle(Access::Read).await?;
        let mut docs = collection
            .find(
                &filter,
                &FindOptions::new()
                    .sort(ID_FIELD, OrderDirection::Descending)
                    .limit(limit as u64 + 1),
            )
            .await?;

        let next_cursor = if docs.len() > limit {
            docs.truncate(limit);
            match docs.last().and_then(|doc| doc.get(ID_FIELD)).and_then(Value::as_str) {
                Some(id) => Some(encode_cursor(&CampaignCursor {
                    before_id: id.to_string(),
                })?),
                None => None,
            }
        } else {
            None
        };

        let data = docs.into_iter().map(into_campaign).collect::<Result<_>>()?;
        Ok(Page { data, next_cursor })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::storage;
    use super::*;
    use serde_json::json;

    fn scheduled(id: &str, start_at: i64, active: bool) -> Campaign {
        let mut campaign = Campaign::new(format!("campaign {}", id), "/hello");
        campaign.id = id.to_string();
        campaign.start_at = Some(start_at);
        campaign.active = active;
        campaign
    }

    #[tokio::test]
    async fn upsert_without_id_generates_one() {
        let storage = storage();
        let mut extra = Document::new();
        extra.insert("queued".into(), json!(3));
        let created = storage
            .upsert_campaign(Campaign::new("welcome", "/start"), Some(extra))
            .await
            .unwrap();
        assert_eq!(created.id.len(), 32);
        assert_eq!(created.queued, 3);

        let found = storage.get_campaign_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(found, created);
    }

    #[tokio::test]
    async fn upsert_with_id_keeps_existing_fields() {
        let storage = storage();
        let mut campaign = Campaign::new("first", "/a");
        campaign.id = "c1".into();
        storage.upsert_campaign(campaign.clone(), None).await.unwrap();

        campaign.name = "second".into();
        let mut update = Document::new();
        update.insert("active".into(), json!(true));
        let stored = storage.upsert_campaign(campaign, Some(update)).await.unwrap();
        assert_eq!(stored.name, "first");
        assert!(stored.active);
    }

    #[tokio::test]
    async fn counters_and_updates() {
        let storage = storage();
        storage.upsert_campaign(scheduled("c1", 0, false), None).await.unwrap();

        let mut by = Map::new();
        by.insert("sent".into(), json!(2));
        by.insert("failed".into(), json!(1));
        storage.increment_campaign("c1", by.clone()).await.unwrap();
        storage.increment_campaign("c1", by).await.unwrap();

        let mut data = Document::new();
        data.insert("name".into(), json!("renamed"));
        let updated = storage.update_campaign("c1", data).await.unwrap().unwrap();
        assert_eq!(updated.sent, 4);
        assert_eq!(updated.failed, 2);
        assert_eq!(updated.name, "renamed");

        storage.remove_campaign("c1").await.unwrap();
        assert!(storage.get_campaign_by_id("c1").await.unwrap().is_none());
        assert!(storage.update_campaign("c1", Document::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pop_claims_due_active_campaigns_once() {
        let storage = storage();
        storage.upsert_campaign(scheduled("due", 100, true), None).await.unwrap();
        storage.upsert_campaign(scheduled("inactive", 100, false), None).await.unwrap();
        storage.upsert_campaign(scheduled("later", 5_000, true), None).await.unwrap();

        let popped = storage.pop_campaign(Some(1_000)).await.unwrap().unwrap();
        assert_eq!(popped.id, "due");
        assert_eq!(popped.start_at, Some(100));
        assert!(storage.pop_campaign(Some(1_000)).await.unwrap().is_none());

        let claimed = storage.get_campaign_by_id("due").await.unwrap().unwrap();
        assert_eq!(claimed.start_at, None);
    }

    #[tokio::test]
    async fn lookup_by_ids() {
        let storage = storage();
        for id in ["a", "b", "c"] {
            storage.upsert_campaign(scheduled(id, 0, true), None).await.unwrap();
        }
        let mut found: Vec<_> = storage
            .get_campaign_by_ids(&["a".into(), "c".into(), "x".into()])
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        found.sort();
        assert_eq!(found, ["a", "c"]);
        assert!(storage.get_campaign_by_ids(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn listing_pages_newest_first() {
        let storage = storage();
        for id in ["a", "b", "c", "d", "e"] {
            storage.upsert_campaign(scheduled(id, 0, id != "c"), None).await.unwrap();
        }

        let first = storage.get_campaigns(Filter::All, Some(2), None).await.unwrap();
        let ids: Vec<_> = first.data.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["e", "d"]);

        let second = storage
            .get_campaigns(Filter::All, Some(2), first.next_cursor.as_deref())
            .await
            .unwrap();
        let ids: Vec<_> = second.data.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c", "b"]);

        let last = storage
            .get_campaigns(Filter::All, Some(2), second.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(last.data.len(), 1);
        assert!(!last.has_next());

        let active = storage
            .get_campaigns(Filter::eq("active", true), None, None)
            .await
            .unwrap();
        assert_eq!(active.data.len(), 4);
    }

    #[tokio::test]
    async fn bad_cursor_is_rejected() {
        let storage = storage();
        let err = storage
            .get_campaigns(Filter::All, None, Some("not a cursor"))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::Cursor(_)));
    }
}
