//! Declared shape of a collection

use serde_json::Value;

use crate::document::{Document, IndexSpec, ID_FIELD};
use crate::error::{Error, Result};

/// Name, indexes and fixture documents of a collection
///
/// ```
/// use chatbot_storage::document::IndexSpec;
/// use chatbot_storage::provision::CollectionDescriptor;
///
/// let descriptor = CollectionDescriptor::new("states")
///     .index(IndexSpec::new("senderId_1_pageId_1").asc("senderId").asc("pageId").unique())
///     .unwrap();
/// assert_eq!(descriptor.indexes().len(), 1);
///
/// assert!(CollectionDescriptor::new("states").index(IndexSpec::new("").asc("a")).is_err());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionDescriptor {
    name: String,
    indexes: Vec<IndexSpec>,
    fixtures: Vec<Document>,
}

impl CollectionDescriptor {
    /// Descriptor without indexes or fixtures
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
            fixtures: Vec::new(),
        }
    }

    /// Declare an index
    pub fn index(mut self, spec: IndexSpec) -> Result<Self> {
        self.add_index(spec)?;
        Ok(self)
    }

    /// Declare an index in place
    pub fn add_index(&mut self, spec: IndexSpec) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "`name` is missing in index specification on '{}'",
                self.name
            )));
        }
        if spec.keys.is_empty() {
            return Err(Error::Config(format!(
                "index '{}' on '{}' has no keys",
                spec.name, self.name
            )));
        }
        if self.indexes.iter().any(|i| i.name == spec.name) {
            return Err(Error::Config(format!(
                "index '{}' declared twice on '{}'",
                spec.name, self.name
            )));
        }
        self.indexes.push(spec);
        Ok(())
    }

    /// Declare a fixture document, which must carry a string `_id`
    pub fn fixture(mut self, doc: Document) -> Result<Self> {
        if !matches!(doc.get(ID_FIELD), Some(Value::String(_))) {
            return Err(Error::Config(format!(
                "fixture for '{}' has no string `_id`",
                self.name
            )));
        }
        self.fixtures.push(doc);
        Ok(self)
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared indexes
    pub fn indexes(&self) -> &[IndexSpec] {
        &self.indexes
    }

    /// Fixture documents
    pub fn fixtures(&self) -> &[Document] {
        &self.fixtures
    }
}
