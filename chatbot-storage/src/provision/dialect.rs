//! Backend query dialects
//!
//! Everything that differs between a full-featured document database and a
//! restricted one (eventual index consistency, no text indexes, row caps per
//! request) is decided here, once, instead of at every call site.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::document::value::{lookup, values_equal};
use crate::document::{
    DocumentCollection, DocumentEngine, Filter, FindOptions, OrderDirection, Projection,
    ID_FIELD,
};
use crate::error::{DatabaseErrorKind, DbResult};

/// Row cap per request on restricted backends
pub const RESTRICTED_PAGE_CAP: u64 = 999;

/// Query dialect of the backing database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Implicit collections, text search, native `distinct`, no row cap
    #[default]
    Standard,
    /// Explicit collections, prefix search, scanned `distinct`, capped pages
    Restricted,
}

impl Dialect {
    /// Handle to a collection, creating it first where the backend needs that
    ///
    /// A concurrent creator winning the race is not an error.
    pub async fn ensure_collection(
        &self,
        engine: &dyn DocumentEngine,
        name: &str,
    ) -> DbResult<Arc<dyn DocumentCollection>> {
        if *self == Dialect::Restricted {
            let existing = engine.list_collections().await?;
            if !existing.iter().any(|c| c == name) {
                match engine.create_collection(name).await {
                    Ok(()) => tracing::debug!(collection = name, "collection created"),
                    Err(e) if e.is_network() => return Err(e),
                    Err(e) => {
                        tracing::debug!(collection = name, error = %e, "collection already created")
                    }
                }
            }
        }
        Ok(engine.collection(name))
    }

    /// Whether searches may use full-text queries
    pub fn supports_text_search(&self) -> bool {
        *self == Dialect::Standard
    }

    /// Filter for a user search over identifying fields
    ///
    /// Full-text when the dialect supports it and the text index exists,
    /// otherwise a case-sensitive prefix match on `senderId` or `name`.
    pub fn search_filter(&self, term: &str, text_index_available: bool) -> Filter {
        if self.supports_text_search() && text_index_available {
            return Filter::text(term);
        }
        let pattern = format!("^{}", regex::escape(term));
        Filter::any_of(vec![
            Filter::regex("senderId", pattern.clone()),
            Filter::regex("name", pattern),
        ])
    }

    /// Per-request row cap
    pub fn page_cap(&self) -> Option<u64> {
        match self {
            Dialect::Standard => None,
            Dialect::Restricted => Some(RESTRICTED_PAGE_CAP),
        }
    }

    /// Direction of the `lastInteraction` index
    pub fn sort_direction_for_index(&self) -> OrderDirection {
        match self {
            Dialect::Standard => OrderDirection::Descending,
            Dialect::Restricted => OrderDirection::Ascending,
        }
    }

    /// Distinct values of a field
    ///
    /// Restricted backends, and standard ones refusing `distinct`, are
    /// scanned page by page and deduplicated.
    pub async fn distinct(
        &self,
        collection: &dyn DocumentCollection,
        field: &str,
        filter: &Filter,
    ) -> DbResult<Vec<Value>> {
        if *self == Dialect::Standard {
            match collection.distinct(field, filter).await {
                Err(e) if e.kind == DatabaseErrorKind::NotSupported => {
                    tracing::debug!(collection = collection.name(), field, "distinct unsupported, scanning");
                }
                other => return other,
            }
        }

        let options = FindOptions::new().projection(Projection::include([field]));
        let docs = self.find_all(collection, filter, options).await?;
        let mut values: Vec<Value> = Vec::new();
        for doc in &docs {
            let found = match lookup(doc, field) {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for value in found {
                if !values.iter().any(|v| values_equal(v, &value)) {
                    values.push(value);
                }
            }
        }
        Ok(values)
    }

    /// Run a find, splitting it into capped requests when the backend needs it
    ///
    /// Paging is by `_id` ascending unless the options carry a sort. The
    /// requested limit still applies to the accumulated result.
    pub async fn find_all(
        &self,
        collection: &dyn DocumentCollection,
        filter: &Filter,
        options: FindOptions,
    ) -> DbResult<Vec<crate::document::Document>> {
        let Some(cap) = self.page_cap() else {
            return collection.find(filter, &options).await;
        };

        let mut options = options;
        if options.sort.is_empty() {
            options = options.sort(ID_FIELD, OrderDirection::Ascending);
        }
        let wanted = options.limit;
        let mut skip = options.skip;
        let mut out = Vec::new();

        loop {
            let remaining = wanted.map(|w| w.saturating_sub(out.len() as u64));
            let chunk = remaining.map_or(cap, |r| r.min(cap));
            if chunk == 0 {
                break;
            }
            let page = collection
                .find(filter, &options.clone().skip(skip).limit(chunk))
                .await?;
            let fetched = page.len() as u64;
            out.extend(page);
            if fetched < chunk {
                break;
            }
            skip += fetched;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Capabilities, MemoryEngine};
    use serde_json::json;

    #[test]
    fn search_filter_escapes_prefix() {
        let filter = Dialect::Restricted.search_filter("a.b(", true);
        assert_eq!(
            filter,
            Filter::any_of(vec![
                Filter::regex("senderId", "^a\\.b\\("),
                Filter::regex("name", "^a\\.b\\("),
            ])
        );
        assert_eq!(Dialect::Standard.search_filter("jane", true), Filter::text("jane"));
        assert!(!Dialect::Standard.search_filter("jane", false).has_text());
    }

    #[tokio::test]
    async fn restricted_creates_collections_explicitly() {
        let engine = MemoryEngine::new();
        Dialect::Restricted
            .ensure_collection(&engine, "states")
            .await
            .unwrap();
        Dialect::Restricted
            .ensure_collection(&engine, "states")
            .await
            .unwrap();
        assert_eq!(engine.list_collections().await.unwrap(), vec!["states".to_string()]);

        Dialect::Standard.ensure_collection(&engine, "lazy").await.unwrap();
        assert_eq!(engine.list_collections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_falls_back_to_scanning() {
        let engine = MemoryEngine::with_capabilities(Capabilities::restricted());
        let c = engine.collection("tasks");
        for id in ["a", "b", "a"] {
            c.insert_one(json!({ "campaignId": id }).as_object().cloned().unwrap())
                .await
                .unwrap();
        }

        for dialect in [Dialect::Standard, Dialect::Restricted] {
            let values = dialect.distinct(c.as_ref(), "campaignId", &Filter::All).await.unwrap();
            assert_eq!(values, vec![json!("a"), json!("b")]);
        }
    }

    #[tokio::test]
    async fn find_all_pages_past_the_cap() {
        let engine = MemoryEngine::new();
        let c = engine.collection("subs");
        for n in 0..(RESTRICTED_PAGE_CAP + 5) {
            c.insert_one(json!({ "n": n }).as_object().cloned().unwrap())
                .await
                .unwrap();
        }

        let all = Dialect::Restricted
            .find_all(c.as_ref(), &Filter::All, FindOptions::new())
            .await
            .unwrap();
        assert_eq!(all.len() as u64, RESTRICTED_PAGE_CAP + 5);

        let limited = Dialect::Restricted
            .find_all(c.as_ref(), &Filter::All, FindOptions::new().limit(1000))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1000);
        assert_eq!(limited[999]["n"], json!(999));
    }
}
