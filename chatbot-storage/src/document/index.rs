//! Secondary index specifications

use serde::{Deserialize, Serialize};

/// Name of the primary-key index, never dropped by reconciliation
pub const PRIMARY_INDEX: &str = "_id_";

/// Kind of one index key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKey {
    /// Ascending (`1`)
    Ascending,
    /// Descending (`-1`)
    Descending,
    /// Full-text
    Text,
}

/// A named, possibly compound and unique, secondary index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Index name; reconciliation compares indexes by name only
    pub name: String,
    /// Keyed fields in order
    pub keys: Vec<(String, IndexKey)>,
    /// Reject documents duplicating the key tuple
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Empty index with the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            keys: Vec::new(),
            unique: false,
        }
    }

    /// Add an ascending key
    #[must_use]
    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), IndexKey::Ascending));
        self
    }

    /// Add a descending key
    #[must_use]
    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.keys.push((field.into(), IndexKey::Descending));
        self
    }

    /// Add a key with an explicit kind
    #[must_use]
    pub fn key(mut self, field: impl Into<String>, kind: IndexKey) -> Self {
        self.keys.push((field.into(), kind));
        self
    }

    /// Full-text index over every string field
    pub fn text_wildcard(name: impl Into<String>) -> Self {
        Self::new(name).key("$**", IndexKey::Text)
    }

    /// Mark the index unique
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Whether any key is full-text
    pub fn is_text(&self) -> bool {
        self.keys.iter().any(|(_, kind)| *kind == IndexKey::Text)
    }

    /// The primary-key index every collection has
    pub fn primary() -> Self {
        Self::new(PRIMARY_INDEX).asc("_id").unique()
    }
}
