//! Audit entry types
//!
//! An [`AuditEvent`] describes what happened. [`AuditLogStorage::log`](super::AuditLogStorage::log)
//! wraps it into an [`AuditEntry`] with the workspace, sequence number,
//! retry delay and signature.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::signing::Signable;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Kind of event, `"audit"` unless stated otherwise
    #[serde(default = "default_event_type")]
    pub event_type: String,
    /// Event category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Action taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Human readable label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Event data
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Any other event field
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_event_type() -> String {
    "audit".to_string()
}

impl Default for AuditEvent {
    fn default() -> Self {
        Self {
            event_type: default_event_type(),
            category: None,
            action: None,
            label: None,
            payload: Value::Null,
            extra: Map::new(),
        }
    }
}

impl AuditEvent {
    /// Audit event with a category and an action
    pub fn new(category: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            action: Some(action.into()),
            ..Default::default()
        }
    }

    /// Set the event type
    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    /// Set the label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the payload
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Add a custom field
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Who did it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditUser {
    /// User id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Bearer token proving the user id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    /// Any other user field
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AuditUser {
    /// User known by id
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    /// Attach a bearer token
    pub fn with_jwt(mut self, jwt: impl Into<String>) -> Self {
        self.jwt = Some(jwt.into());
        self
    }

    /// Whether the entry can be checked against its token
    pub fn is_verifiable(&self) -> bool {
        self.id.is_some() && self.jwt.is_some()
    }
}

/// Criticality of an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    /// Must be looked at
    Critical,
    /// Business relevant
    #[default]
    Important,
    /// Diagnostics
    Debug,
}

/// Nature of an entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Something failed
    Error,
    /// Something looks wrong
    Warn,
    /// Plain record
    #[default]
    Info,
}

/// A stored audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When it happened
    #[serde(with = "millis_rfc3339")]
    pub date: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub event: AuditEvent,
    /// Criticality
    pub level: Level,
    /// Free-form context
    #[serde(default)]
    pub meta: Map<String, Value>,
    /// Nature
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    /// Who did it
    #[serde(default)]
    pub user: AuditUser,
    /// Workspace
    pub wid: String,
    /// Position in the workspace chain, from 0
    pub seq: u64,
    /// Milliseconds spent retrying before the entry was stored
    #[serde(default)]
    pub delta: u64,
    /// Signature chained to the previous entry, `None` when unsigned
    #[serde(default)]
    pub sign: Option<String>,
    /// Verification outcome, set by listings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
}

impl AuditEntry {
    pub(crate) fn new(
        event: AuditEvent,
        user: AuditUser,
        meta: Map<String, Value>,
        wid: String,
        entry_type: EntryType,
        level: Level,
        date: DateTime<Utc>,
    ) -> Self {
        Self {
            date: date.trunc_subsecs(3),
            event,
            level,
            meta,
            entry_type,
            user,
            wid,
            seq: 0,
            delta: 0,
            sign: None,
            ok: None,
        }
    }
}

impl Signable for AuditEntry {
    fn signing_document(&self) -> Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

mod millis_rfc3339 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::signing::format_date;

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_date(date))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|date| date.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
