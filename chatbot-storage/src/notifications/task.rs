//! Delivery tasks

use std::collections::HashMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{with_public_id, without_database_id, NotificationsStorage, MAX_TS};
use crate::document::{
    from_document, to_document, Document, Filter, FindOneAndUpdateOptions, FindOptions,
    OrderDirection, Projection, Update, UpdateOne, ID_FIELD,
};
use crate::error::Result;
use crate::provision::Access;

/// Fields identifying the same logical task across pushes
const KEY_FIELDS: &[&str] = &["campaignId", "senderId", "pageId", "sent"];

/// A campaign message for one recipient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Database id, `None` until stored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Campaign
    pub campaign_id: String,
    /// Recipient
    pub sender_id: String,
    /// Recipient's page
    pub page_id: String,
    /// Due time in epoch milliseconds, [`MAX_TS`] once claimed
    pub enqueue: i64,
    /// Earliest enqueue time seen for this task, `-1` when unknown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ins_enqueue: Option<i64>,
    /// Pushes since the last claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ups: Option<i64>,
    /// When the message was sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent: Option<i64>,
    /// Delivery receipt time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery: Option<i64>,
    /// Read receipt time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<i64>,
    /// Whether the recipient reacted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reaction: Option<bool>,
    /// When the message was skipped because the recipient left
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaved: Option<i64>,
    /// Any other task field
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Task {
    /// Unsent task due at `enqueue`
    pub fn new(
        campaign_id: impl Into<String>,
        sender_id: impl Into<String>,
        page_id: impl Into<String>,
        enqueue: i64,
    ) -> Self {
        Self {
            id: None,
            campaign_id: campaign_id.into(),
            sender_id: sender_id.into(),
            page_id: page_id.into(),
            enqueue,
            ins_enqueue: None,
            ups: None,
            sent: None,
            delivery: None,
            read: None,
            reaction: None,
            leaved: None,
            extra: Map::new(),
        }
    }

    fn key_filter(&self) -> Filter {
        Filter::all_of(vec![
            Filter::eq("campaignId", self.campaign_id.as_str()),
            Filter::eq("senderId", self.sender_id.as_str()),
            Filter::eq("pageId", self.page_id.as_str()),
            Filter::eq("sent", self.sent.map_or(Value::Null, Value::from)),
        ])
    }
}

/// A recipient of a campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskTarget {
    /// Recipient
    pub sender_id: String,
    /// Recipient's page
    pub page_id: String,
}

/// Receipt kind applied by [`NotificationsStorage::update_tasks_by_watermark`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatermarkEvent {
    /// Message was read
    Read,
    /// Message was delivered
    Delivery,
}

impl WatermarkEvent {
    /// Task field holding the receipt time
    pub fn field(&self) -> &'static str {
        match self {
            WatermarkEvent::Read => "read",
            WatermarkEvent::Delivery => "delivery",
        }
    }
}

fn into_task(doc: Document) -> Result<Task> {
    from_document(with_public_id(doc))
}

fn as_i64(doc: &Document, field: &str) -> Option<i64> {
    doc.get(field).and_then(Value::as_i64)
}

impl NotificationsStorage {
    /// Insert tasks or merge them into the existing ones with the same key
    ///
    /// Returns the tasks with their ids and effective `insEnqueue`. A merged
    /// task that is due at its first enqueue time and was pushed more than
    /// once since its last claim is reported one millisecond later. A task
    /// that vanished between the write and the re-read comes back without id
    /// and with `insEnqueue` `-1`.
    pub async fn push_tasks(&self, tasks: Vec<Task>) -> Result<Vec<Task>> {
        if tasks.is_empty() {
            return Ok(tasks);
        }
        let collection = self.tasks.handle(Access::Write).await?;

        let operations = tasks
            .iter()
            .map(|task| {
                let mut fields = to_document(task)?;
                for field in KEY_FIELDS.iter().chain(&["id", "insEnqueue", "ups"]) {
                    fields.remove(*field);
                }
                Ok(UpdateOne {
                    filter: task.key_filter(),
                    update: Update::new()
                        .set_all(fields)
                        .inc("ups", 1)
                        .min("insEnqueue", task.enqueue),
                    upsert: true,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let outcome = collection.bulk_update(&operations, true).await?;

        let lookups = tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| !outcome.upserted_ids.contains_key(i))
            .map(|(i, task)| {
                let collection = &collection;
                async move {
                    let found = collection
                        .find_one(
                            &task.key_filter(),
                            &FindOptions::new()
                                .projection(Projection::include(["insEnqueue", "enqueue", "ups"])),
                        )
                        .await?;
                    Ok::<_, crate::Error>((i, found))
                }
            });
        let mut merged = HashMap::new();
        for result in join_all(lookups).await {
            let (i, found) = result?;
            merged.insert(i, found);
        }

        Ok(tasks
            .into_iter()
            .enumerate()
            .map(|(i, mut task)| {
                if let Some(id) = outcome.upserted_ids.get(&i) {
                    task.id = Some(id.clone());
                    task.ins_enqueue = Some(task.enqueue);
                    return task;
                }
                match merged.remove(&i).flatten() {
                    None => {
                        tracing::debug!(
                            campaign = %task.campaign_id,
                            sender = %task.sender_id,
                            "pushed task vanished before it was re-read"
                        );
                        task.id = None;
                        task.ins_enqueue = Some(-1);
                    }
                    Some(found) => {
                        let ins_enqueue = as_i64(&found, "insEnqueue");
                        let enqueue = as_i64(&found, "enqueue").unwrap_or(task.enqueue);
                        let ups = as_i64(&found, "ups");
                        task.id = found.get(ID_FIELD).and_then(Value::as_str).map(str::to_string);
                        task.ins_enqueue = ins_enqueue;
                        let bumped =
                            ins_enqueue == Some(enqueue) && enqueue != MAX_TS && ups != Some(1);
                        task.enqueue = if bumped { enqueue + 1 } else { enqueue };
                    }
                }
                task
            })
            .collect())
    }

    /// Claim up to `limit` due tasks, earliest first
    ///
    /// `until` defaults to now. Each claim is a single conditional update, so
    /// a task is handed to exactly one caller.
    pub async fn pop_tasks(&self, limit: usize, until: Option<i64>) -> Result<Vec<Task>> {
        let until = until.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let collection = self.tasks.handle(Access::Write).await?;

        let filter = Filter::lte("enqueue", until);
        let update = Update::new()
            .set("enqueue", MAX_TS)
            .set("insEnqueue", MAX_TS)
            .set("ups", 0);
        let options = FindOneAndUpdateOptions::new().sort("enqueue", OrderDirection::Ascending);

        let mut popped = Vec::new();
        while popped.len() < limit {
            match collection.find_one_and_update(&filter, &update, &options).await? {
                Some(doc) => popped.push(into_task(doc)?),
                None => break,
            }
        }
        Ok(popped)
    }

    /// Recipients of a campaign who left, or who were sent it and did not react
    pub async fn get_unsuccessful_subscribers_by_campaign(
        &self,
        campaign_id: &str,
        sent_without_reaction: bool,
        page_id: Option<&str>,
    ) -> Result<Vec<TaskTarget>> {
        let mut conditions = vec![Filter::eq("campaignId", campaign_id)];
        if let Some(page_id) = page_id {
            conditions.push(Filter::eq("pageId", page_id));
        }
        if sent_without_reaction {
            conditions.push(Filter::is_null("leaved"));
            conditions.push(Filter::eq("reaction", false));
        } else {
            conditions.push(Filter::gt("leaved", 0));
        }

        let collection = self.tasks.handle(Access::Read).await?;
        let options = FindOptions::new().projection(Projection::include(["senderId", "pageId"]));
        let docs = self
            .dialect
            .find_all(collection.as_ref(), &Filter::all_of(conditions), options)
            .await?;
        docs.into_iter()
            .map(|doc| from_document(without_database_id(doc)))
            .collect()
    }

    /// A task by its database id
    pub async fn get_task_by_id(&self, task_id: &str) -> Result<Option<Task>> {
        let collection = self.tasks.handle(Access::Write).await?;
        collection
            .find_one(&Filter::eq(ID_FIELD, task_id), &FindOptions::new())
            .await?
            .map(into_task)
            .transpose()
    }

    /// Set fields of a task, returning the updated task
    pub async fn update_task(&self, task_id: &str, data: Document) -> Result<Option<Task>> {
        let collection = self.tasks.handle(Access::Write).await?;
        collection
            .find_one_and_update(
                &Filter::eq(ID_FIELD, task_id),
                &Update::new().set_all(data),
                &FindOneAndUpdateOptions::new(),
            )
            .await?
            .map(into_task)
            .transpose()
    }

    /// The most recently sent task of a campaign for a recipient
    pub async fn get_sent_task(
        &self,
        page_id: &str,
        sender_id: &str,
        campaign_id: &str,
    ) -> Result<Option<Task>> {
        let collection = self.tasks.handle(Access::Write).await?;
        let filter = Filter::all_of(vec![
            Filter::eq("pageId", page_id),
            Filter::eq("senderId", sender_id),
            Filter::eq("campaignId", campaign_id),
            Filter::gte("sent", 1),
        ]);
        collection
            .find_one(&filter, &FindOptions::new().sort("sent", OrderDirection::Descending))
            .await?
            .map(into_task)
            .transpose()
    }

    /// Which of `campaign_ids` were already sent to a recipient
    pub async fn get_sent_campaign_ids(
        &self,
        page_id: &str,
        sender_id: &str,
        campaign_ids: &[String],
    ) -> Result<Vec<String>> {
        let collection = self.tasks.handle(Access::Read).await?;
        let filter = Filter::all_of(vec![
            Filter::eq("pageId", page_id),
            Filter::eq("senderId", sender_id),
            Filter::in_values("campaignId", campaign_ids.iter().map(String::as_str)),
            Filter::gte("sent", 1),
        ]);
        let values = self
            .dialect
            .distinct(collection.as_ref(), "campaignId", &filter)
            .await?;
        Ok(values
            .into_iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect())
    }

    /// Stamp a receipt on every task sent to a recipient up to `watermark`
    ///
    /// Tasks that already carry the receipt are left alone. Returns the
    /// tasks this call updated. `ts` defaults to now.
    pub async fn update_tasks_by_watermark(
        &self,
        sender_id: &str,
        page_id: &str,
        watermark: i64,
        event: WatermarkEvent,
        ts: Option<i64>,
    ) -> Result<Vec<Task>> {
        let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let field = event.field();
        let collection = self.tasks.handle(Access::Write).await?;

        let pending = collection
            .find(
                &Filter::all_of(vec![
                    Filter::eq("senderId", sender_id),
                    Filter::eq("pageId", page_id),
                    Filter::lte("sent", watermark),
                    Filter::is_null(field),
                ]),
                &FindOptions::new().projection(Projection::include([ID_FIELD])),
            )
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let update = Update::new().set(field, ts);
        let options = FindOneAndUpdateOptions::new();
        let updates = pending.iter().filter_map(|doc| doc.get(ID_FIELD)).map(|id| {
            let filter = Filter::eq(ID_FIELD, id.clone()).and(Filter::is_null(field));
            let collection = &collection;
            let update = &update;
            let options = &options;
            async move { collection.find_one_and_update(&filter, update, options).await }
        });

        let mut updated = Vec::new();
        for result in join_all(updates).await {
            if let Some(doc) = result? {
                updated.push(into_task(doc)?);
            }
        }
        Ok(updated)
    }
}
