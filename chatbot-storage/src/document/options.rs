//! Options and outcomes for collection operations

use std::collections::BTreeMap;
use std::fmt;

use super::{Document, Filter, Update};
use super::value::lookup;

/// Direction for ordering results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    /// Sort in ascending order (A-Z, 0-9)
    #[default]
    Ascending,
    /// Sort in descending order (Z-A, 9-0)
    Descending,
}

impl fmt::Display for OrderDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ascending => write!(f, "asc"),
            Self::Descending => write!(f, "desc"),
        }
    }
}

/// One component of a sort order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    /// Sort by a (dotted) field
    Field(String, OrderDirection),
    /// Most relevant first, for full-text queries
    TextScore,
}

/// Field selection applied to returned documents
///
/// An inclusion projection keeps the listed paths plus `_id` unless
/// [`Projection::without_id`] is used. An exclusion projection drops the
/// listed paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Projection {
    /// Keep only these paths (and `_id`)
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: fields.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    /// Drop these paths
    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            include: Vec::new(),
            exclude: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Also drop `_id`
    #[must_use]
    pub fn without_id(mut self) -> Self {
        self.exclude.push("_id".to_string());
        self
    }

    /// Included paths
    pub fn included(&self) -> &[String] {
        &self.include
    }

    /// Excluded paths
    pub fn excluded(&self) -> &[String] {
        &self.exclude
    }

    /// Apply the projection to a document
    pub fn apply(&self, doc: Document) -> Document {
        if self.include.is_empty() {
            let mut doc = doc;
            for path in &self.exclude {
                super::update::remove_path(&mut doc, path);
            }
            return doc;
        }

        let mut out = Document::new();
        let keep_id = !self.exclude.iter().any(|p| p == "_id");
        if keep_id {
            if let Some(id) = doc.get("_id") {
                out.insert("_id".to_string(), id.clone());
            }
        }
        for path in &self.include {
            if let Some(value) = lookup(&doc, path) {
                // set_path only fails on non-object parents, which a fresh document never has
                let _ = super::update::set_path(&mut out, path, value.clone());
            }
        }
        out
    }
}

/// Options for `find` and `find_one`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Sort order, applied left to right
    pub sort: Vec<SortKey>,
    /// Documents to skip
    pub skip: u64,
    /// Maximum documents to return
    pub limit: Option<u64>,
    /// Field selection
    pub projection: Option<Projection>,
}

impl FindOptions {
    /// Default options: natural order, no limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field sort
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.sort.push(SortKey::Field(field.into(), direction));
        self
    }

    /// Order by full-text relevance
    #[must_use]
    pub fn sort_by_text_score(mut self) -> Self {
        self.sort.push(SortKey::TextScore);
        self
    }

    /// Skip documents
    #[must_use]
    pub fn skip(mut self, skip: u64) -> Self {
        self.skip = skip;
        self
    }

    /// Limit documents
    #[must_use]
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Select fields
    #[must_use]
    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// Which version of the document `find_one_and_update` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReturnDocument {
    /// The document as it was before the update (`None` for upserts)
    Before,
    /// The document after the update
    #[default]
    After,
}

/// Options for `find_one_and_update`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOneAndUpdateOptions {
    /// Insert a new document when nothing matches
    pub upsert: bool,
    /// Which matching document to pick first
    pub sort: Vec<SortKey>,
    /// Version of the document to return
    pub return_document: ReturnDocument,
    /// Field selection on the returned document
    pub projection: Option<Projection>,
}

impl FindOneAndUpdateOptions {
    /// Return the updated document, no upsert
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable upsert
    #[must_use]
    pub fn upsert(mut self) -> Self {
        self.upsert = true;
        self
    }

    /// Append a field sort
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.sort.push(SortKey::Field(field.into(), direction));
        self
    }

    /// Return the document as it was before the update
    #[must_use]
    pub fn return_before(mut self) -> Self {
        self.return_document = ReturnDocument::Before;
        self
    }

    /// Select fields
    #[must_use]
    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }
}

/// One operation of a bulk update
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOne {
    /// Document selector
    pub filter: Filter,
    /// Operators
    pub update: Update,
    /// Insert when nothing matches
    pub upsert: bool,
}

/// Result of `update_one`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Documents matched by the filter (0 or 1)
    pub matched: u64,
    /// Id of the inserted document, for upserts that inserted
    pub upserted_id: Option<String>,
}

/// Result of `bulk_update`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// Operations that matched an existing document
    pub matched: u64,
    /// Ids of inserted documents keyed by operation index
    pub upserted_ids: BTreeMap<usize, String>,
}
