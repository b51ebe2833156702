//! In-process document engine
//!
//! Every collection sits behind a `std::sync::Mutex`. Each operation takes
//! the lock once, so single-document operations are atomic with respect to
//! each other, which is exactly the guarantee the adapters build on. The
//! lock is never held across an `.await`.
//!
//! Two knobs make it useful for exercising degraded behavior:
//!
//! - [`Capabilities`] switch off unique indexes, text indexes or `distinct`,
//!   the way a weaker backend would refuse them
//! - [`MemoryEngine::inject_fault`] makes the next N operations of a kind fail
//!   with a chosen error (network errors, duplicate keys)

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::filter::text_score;
use super::update::set_path;
use super::value::{lookup, total_cmp, values_equal};
use super::{
    BulkOutcome, Document, DocumentCollection, DocumentEngine, Filter, FindOneAndUpdateOptions,
    FindOptions, IndexSpec, OrderDirection, Projection, ReturnDocument, SortKey, Update,
    UpdateOne, UpdateOutcome, ID_FIELD, PRIMARY_INDEX,
};
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, DbResult};

/// Features the engine accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Unique indexes can be created
    pub unique_indexes: bool,
    /// Text indexes can be created (and text queries run)
    pub text_indexes: bool,
    /// `distinct` is available
    pub distinct: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            unique_indexes: true,
            text_indexes: true,
            distinct: true,
        }
    }
}

impl Capabilities {
    /// A backend refusing unique indexes, text indexes and `distinct`
    pub fn restricted() -> Self {
        Self {
            unique_indexes: false,
            text_indexes: false,
            distinct: false,
        }
    }
}

/// Operation class targeted by an injected fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    /// Every operation
    Any,
    /// `find`, `find_one`, `count`
    Read,
    /// `insert_one`
    Insert,
    /// `find_one_and_update`, `update_one`, `bulk_update`
    Update,
    /// `delete_one`, `delete_many`, `find_one_and_delete`
    Delete,
    /// Index listing, creation and removal, explicit collection creation
    Index,
    /// `distinct`, `group_count`
    Aggregate,
}

impl FaultOp {
    fn operation(self) -> DatabaseOperation {
        match self {
            FaultOp::Any | FaultOp::Read => DatabaseOperation::Query,
            FaultOp::Insert => DatabaseOperation::Insert,
            FaultOp::Update => DatabaseOperation::Update,
            FaultOp::Delete => DatabaseOperation::Delete,
            FaultOp::Index => DatabaseOperation::Index,
            FaultOp::Aggregate => DatabaseOperation::Aggregate,
        }
    }
}

struct Fault {
    collection: String,
    op: FaultOp,
    kind: DatabaseErrorKind,
    remaining: u32,
}

struct Shared {
    capabilities: Capabilities,
    faults: Mutex<Vec<Fault>>,
    next_id: AtomicU64,
}

impl Shared {
    fn take_fault(&self, collection: &str, op: FaultOp) -> DbResult<()> {
        let mut faults = self.faults.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(pos) = faults
            .iter()
            .position(|f| f.collection == collection && (f.op == FaultOp::Any || f.op == op))
        else {
            return Ok(());
        };

        let fault = &mut faults[pos];
        fault.remaining -= 1;
        let kind = fault.kind;
        if fault.remaining == 0 {
            faults.remove(pos);
        }
        Err(DatabaseError::with_context(
            op.operation(),
            kind,
            "injected fault",
            collection,
        ))
    }

    /// Object-id-like identifier: seconds then a process-wide counter, hex
    fn next_id(&self) -> String {
        let seq = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
        let secs = Utc::now().timestamp().max(0) as u32;
        format!("{:08x}{:016x}", secs, seq)
    }
}

/// In-memory [`DocumentEngine`]
pub struct MemoryEngine {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
    shared: Arc<Shared>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Engine with every capability enabled
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::default())
    }

    /// Engine with selected capabilities
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            collections: Mutex::new(HashMap::new()),
            shared: Arc::new(Shared {
                capabilities,
                faults: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make the next `times` operations of class `op` on `collection` fail
    pub fn inject_fault(&self, collection: &str, op: FaultOp, kind: DatabaseErrorKind, times: u32) {
        if times == 0 {
            return;
        }
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Fault {
                collection: collection.to_string(),
                op,
                kind,
                remaining: times,
            });
    }

    /// Remove all pending faults
    pub fn clear_faults(&self) {
        self.shared
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn memory_collection(&self, name: &str) -> Arc<MemoryCollection> {
        let mut collections = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(collections.entry(name.to_string()).or_insert_with(|| {
            Arc::new(MemoryCollection {
                name: name.to_string(),
                shared: Arc::clone(&self.shared),
                state: Mutex::new(CollectionState::default()),
            })
        }))
    }
}

#[async_trait]
impl DocumentEngine for MemoryEngine {
    async fn list_collections(&self) -> DbResult<Vec<String>> {
        let collections: Vec<Arc<MemoryCollection>> = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut names: Vec<String> = collections
            .iter()
            .filter(|c| c.lock().exists)
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str) -> DbResult<()> {
        self.shared.take_fault(name, FaultOp::Index)?;
        let collection = self.memory_collection(name);
        let mut state = collection.lock();
        if state.exists {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Collection,
                DatabaseErrorKind::DuplicateKey,
                "collection already exists",
                name,
            ));
        }
        state.exists = true;
        Ok(())
    }

    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        self.memory_collection(name)
    }
}

#[derive(Default)]
struct CollectionState {
    exists: bool,
    docs: BTreeMap<String, Document>,
    indexes: Vec<IndexSpec>,
}

/// Changes made by one single-document update
struct Applied {
    before: Option<Document>,
    after: Option<Document>,
    upserted_id: Option<String>,
}

impl CollectionState {
    fn has_text_index(&self) -> bool {
        self.indexes.iter().any(IndexSpec::is_text)
    }

    fn matching(&self, filter: &Filter, sort: &[SortKey]) -> DbResult<Vec<(&String, &Document)>> {
        if filter.has_text() && !self.has_text_index() {
            return Err(DatabaseError::query_failed(
                "text index required for full-text search",
            ));
        }

        let mut hits = Vec::new();
        for (id, doc) in &self.docs {
            if filter.matches(doc)? {
                hits.push((id, doc));
            }
        }

        if !sort.is_empty() {
            let term = filter.text_term().unwrap_or_default();
            hits.sort_by(|(_, a), (_, b)| compare_docs(a, b, sort, term));
        }
        Ok(hits)
    }

    fn first_match(&self, filter: &Filter, sort: &[SortKey]) -> DbResult<Option<String>> {
        Ok(self
            .matching(filter, sort)?
            .into_iter()
            .next()
            .map(|(id, _)| id.clone()))
    }

    fn check_unique(
        &self,
        collection: &str,
        candidate: &Document,
        own_id: Option<&str>,
        operation: DatabaseOperation,
    ) -> DbResult<()> {
        for index in self.indexes.iter().filter(|i| i.unique) {
            let key = index_key(index, candidate);
            let clash = self
                .docs
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != own_id)
                .any(|(_, other)| keys_equal(&key, &index_key(index, other)));
            if clash {
                return Err(DatabaseError::with_context(
                    operation,
                    DatabaseErrorKind::DuplicateKey,
                    format!("E11000 duplicate key error, index: {}", index.name),
                    collection,
                ));
            }
        }
        Ok(())
    }

    fn apply_one(
        &mut self,
        collection: &str,
        shared: &Shared,
        filter: &Filter,
        update: &Update,
        sort: &[SortKey],
        upsert: bool,
    ) -> DbResult<Applied> {
        if let Some(id) = self.first_match(filter, sort)? {
            let before = self.docs.get(&id).cloned().unwrap_or_default();
            let mut after = before.clone();
            update.apply(&mut after, false)?;
            after.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            self.check_unique(collection, &after, Some(&id), DatabaseOperation::Update)?;
            self.docs.insert(id, after.clone());
            return Ok(Applied {
                before: Some(before),
                after: Some(after),
                upserted_id: None,
            });
        }

        if !upsert {
            return Ok(Applied {
                before: None,
                after: None,
                upserted_id: None,
            });
        }

        let mut doc = Document::new();
        for (field, value) in filter.equality_fields() {
            set_path(&mut doc, field, value.clone())?;
        }
        update.apply(&mut doc, true)?;
        let id = match doc.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => shared.next_id(),
        };
        doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        if self.docs.contains_key(&id) {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Update,
                DatabaseErrorKind::DuplicateKey,
                format!("E11000 duplicate key error, index: {}", PRIMARY_INDEX),
                collection,
            ));
        }
        self.check_unique(collection, &doc, None, DatabaseOperation::Update)?;
        self.exists = true;
        self.docs.insert(id.clone(), doc.clone());
        Ok(Applied {
            before: None,
            after: Some(doc),
            upserted_id: Some(id),
        })
    }
}

fn index_key(index: &IndexSpec, doc: &Document) -> Vec<Value> {
    index
        .keys
        .iter()
        .map(|(field, _)| lookup(doc, field).cloned().unwrap_or(Value::Null))
        .collect()
}

fn keys_equal(a: &[Value], b: &[Value]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| values_equal(x, y))
}

fn compare_docs(a: &Document, b: &Document, sort: &[SortKey], term: &str) -> Ordering {
    for key in sort {
        let ord = match key {
            SortKey::Field(field, direction) => {
                let left = lookup(a, field).unwrap_or(&Value::Null);
                let right = lookup(b, field).unwrap_or(&Value::Null);
                let ord = total_cmp(left, right);
                match direction {
                    OrderDirection::Ascending => ord,
                    OrderDirection::Descending => ord.reverse(),
                }
            }
            SortKey::TextScore => text_score(b, term).cmp(&text_score(a, term)),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn project(doc: Document, projection: Option<&Projection>) -> Document {
    match projection {
        Some(projection) => projection.apply(doc),
        None => doc,
    }
}

/// One collection of a [`MemoryEngine`]
pub struct MemoryCollection {
    name: String,
    shared: Arc<Shared>,
    state: Mutex<CollectionState>,
}

impl MemoryCollection {
    fn lock(&self) -> MutexGuard<'_, CollectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fault(&self, op: FaultOp) -> DbResult<()> {
        self.shared.take_fault(&self.name, op)
    }
}

#[async_trait]
impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn indexes(&self) -> DbResult<Vec<IndexSpec>> {
        self.fault(FaultOp::Index)?;
        let state = self.lock();
        let mut indexes = vec![IndexSpec::primary()];
        indexes.extend(state.indexes.iter().cloned());
        Ok(indexes)
    }

    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        self.fault(FaultOp::Index)?;
        let capabilities = self.shared.capabilities;
        if spec.unique && !capabilities.unique_indexes {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Index,
                DatabaseErrorKind::NotSupported,
                "unique indexes are not supported",
                spec.name.clone(),
            ));
        }
        if spec.is_text() && !capabilities.text_indexes {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Index,
                DatabaseErrorKind::NotSupported,
                "text indexes are not supported",
                spec.name.clone(),
            ));
        }

        let mut state = self.lock();
        if let Some(existing) = state.indexes.iter().find(|i| i.name == spec.name) {
            if existing == spec {
                return Ok(());
            }
            return Err(DatabaseError::with_context(
                DatabaseOperation::Index,
                DatabaseErrorKind::InvalidInput,
                "an index with this name exists with different options",
                spec.name.clone(),
            ));
        }

        if spec.unique {
            let keys: Vec<Vec<Value>> = state.docs.values().map(|d| index_key(spec, d)).collect();
            for (i, key) in keys.iter().enumerate() {
                if keys[i + 1..].iter().any(|other| keys_equal(key, other)) {
                    return Err(DatabaseError::with_context(
                        DatabaseOperation::Index,
                        DatabaseErrorKind::DuplicateKey,
                        "existing documents violate the unique index",
                        spec.name.clone(),
                    ));
                }
            }
        }

        state.indexes.push(spec.clone());
        state.exists = true;
        Ok(())
    }

    async fn drop_index(&self, name: &str) -> DbResult<()> {
        self.fault(FaultOp::Index)?;
        if name == PRIMARY_INDEX {
            return Err(DatabaseError::invalid_input(
                DatabaseOperation::Index,
                "cannot drop the primary index",
            ));
        }
        let mut state = self.lock();
        let before = state.indexes.len();
        state.indexes.retain(|i| i.name != name);
        if state.indexes.len() == before {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Index,
                DatabaseErrorKind::NotFound,
                "index not found",
                name,
            ));
        }
        Ok(())
    }

    async fn insert_one(&self, mut doc: Document) -> DbResult<String> {
        self.fault(FaultOp::Insert)?;
        let mut state = self.lock();
        let id = match doc.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => self.shared.next_id(),
        };
        if state.docs.contains_key(&id) {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Insert,
                DatabaseErrorKind::DuplicateKey,
                format!("E11000 duplicate key error, index: {}", PRIMARY_INDEX),
                self.name.clone(),
            ));
        }
        doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        state.check_unique(&self.name, &doc, None, DatabaseOperation::Insert)?;
        state.exists = true;
        state.docs.insert(id.clone(), doc);
        Ok(id)
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> DbResult<Vec<Document>> {
        self.fault(FaultOp::Read)?;
        let state = self.lock();
        let hits = state.matching(filter, &options.sort)?;
        let skip = usize::try_from(options.skip).unwrap_or(usize::MAX);
        let limit = options
            .limit
            .map(|l| usize::try_from(l).unwrap_or(usize::MAX))
            .unwrap_or(usize::MAX);
        Ok(hits
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|(_, doc)| project(doc.clone(), options.projection.as_ref()))
            .collect())
    }

    async fn count(&self, filter: &Filter) -> DbResult<u64> {
        self.fault(FaultOp::Read)?;
        let state = self.lock();
        Ok(state.matching(filter, &[])?.len() as u64)
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        options: &FindOneAndUpdateOptions,
    ) -> DbResult<Option<Document>> {
        self.fault(FaultOp::Update)?;
        let mut state = self.lock();
        let applied = state.apply_one(
            &self.name,
            &self.shared,
            filter,
            update,
            &options.sort,
            options.upsert,
        )?;
        let out = match options.return_document {
            ReturnDocument::Before => applied.before,
            ReturnDocument::After => applied.after,
        };
        Ok(out.map(|doc| project(doc, options.projection.as_ref())))
    }

    async fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> DbResult<UpdateOutcome> {
        self.fault(FaultOp::Update)?;
        let mut state = self.lock();
        let applied = state.apply_one(&self.name, &self.shared, filter, update, &[], upsert)?;
        Ok(UpdateOutcome {
            matched: u64::from(applied.before.is_some()),
            upserted_id: applied.upserted_id,
        })
    }

    async fn bulk_update(&self, operations: &[UpdateOne], ordered: bool) -> DbResult<BulkOutcome> {
        self.fault(FaultOp::Update)?;
        let mut outcome = BulkOutcome::default();
        let mut first_error = None;

        for (i, op) in operations.iter().enumerate() {
            let result = {
                let mut state = self.lock();
                state.apply_one(&self.name, &self.shared, &op.filter, &op.update, &[], op.upsert)
            };
            match result {
                Ok(applied) => {
                    if let Some(id) = applied.upserted_id {
                        outcome.upserted_ids.insert(i, id);
                    } else if applied.before.is_some() {
                        outcome.matched += 1;
                    }
                }
                Err(err) if ordered => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }

    async fn delete_one(&self, filter: &Filter) -> DbResult<u64> {
        Ok(u64::from(self.find_one_and_delete(filter).await?.is_some()))
    }

    async fn delete_many(&self, filter: &Filter) -> DbResult<u64> {
        self.fault(FaultOp::Delete)?;
        let mut state = self.lock();
        let ids: Vec<String> = state
            .matching(filter, &[])?
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            state.docs.remove(id);
        }
        Ok(ids.len() as u64)
    }

    async fn find_one_and_delete(&self, filter: &Filter) -> DbResult<Option<Document>> {
        self.fault(FaultOp::Delete)?;
        let mut state = self.lock();
        let Some(id) = state.first_match(filter, &[])? else {
            return Ok(None);
        };
        Ok(state.docs.remove(&id))
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> DbResult<Vec<Value>> {
        self.fault(FaultOp::Aggregate)?;
        if !self.shared.capabilities.distinct {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Aggregate,
                DatabaseErrorKind::NotSupported,
                "distinct is not supported",
                self.name.clone(),
            ));
        }
        let state = self.lock();
        let mut values: Vec<Value> = Vec::new();
        for (_, doc) in state.matching(filter, &[])? {
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

    async fn group_count(&self, filter: &Filter, field: &str) -> DbResult<Vec<(Value, u64)>> {
        self.fault(FaultOp::Aggregate)?;
        let state = self.lock();
        let mut groups: Vec<(Value, u64)> = Vec::new();
        for (_, doc) in state.matching(filter, &[])? {
            let found = match lookup(doc, field) {
                Some(Value::Array(items)) => items.clone(),
                Some(value) => vec![value.clone()],
                None => continue,
            };
            for value in found {
                match groups.iter_mut().find(|(v, _)| values_equal(v, &value)) {
                    Some((_, count)) => *count += 1,
                    None => groups.push((value, 1)),
                }
            }
        }
        groups.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(groups)
    }

    async fn drop_collection(&self) -> DbResult<()> {
        self.fault(FaultOp::Any)?;
        let mut state = self.lock();
        *state = CollectionState::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let engine = MemoryEngine::new();
        let c = engine.collection("things");
        let a = c.insert_one(doc(json!({ "n": 1 }))).await.unwrap();
        let b = c.insert_one(doc(json!({ "n": 2 }))).await.unwrap();
        assert_eq!(a.len(), 24);
        assert!(a < b);

        let all = c.find(&Filter::All, &FindOptions::new()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["_id"], json!(a));
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicates() {
        let engine = MemoryEngine::new();
        let c = engine.collection("states");
        c.create_index(&IndexSpec::new("k").asc("senderId").asc("pageId").unique())
            .await
            .unwrap();
        c.insert_one(doc(json!({ "senderId": "s", "pageId": "p" })))
            .await
            .unwrap();

        let err = c
            .insert_one(doc(json!({ "senderId": "s", "pageId": "p" })))
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());

        let err = c
            .update_one(
                &Filter::eq("senderId", "s").and(Filter::eq("pageId", "p")).and(Filter::lt("lock", 0)),
                &Update::new().set("lock", 1),
                true,
            )
            .await
            .unwrap_err();
        assert!(err.is_duplicate_key());
    }

    #[tokio::test]
    async fn upsert_seeds_equality_fields() {
        let engine = MemoryEngine::new();
        let c = engine.collection("tasks");
        let filter = Filter::eq("campaignId", "c1")
            .and(Filter::eq("senderId", "s1"))
            .and(Filter::is_null("sent"));
        let update = Update::new().set("enqueue", 10).inc("ups", 1).min("insEnqueue", 10);

        let first = c.update_one(&filter, &update, true).await.unwrap();
        assert!(first.upserted_id.is_some());
        assert_eq!(first.matched, 0);

        let second = c.update_one(&filter, &update, true).await.unwrap();
        assert!(second.upserted_id.is_none());
        assert_eq!(second.matched, 1);

        let stored = c.find_one(&filter, &FindOptions::new()).await.unwrap().unwrap();
        assert_eq!(stored["campaignId"], json!("c1"));
        assert_eq!(stored["sent"], json!(null));
        assert_eq!(stored["ups"], json!(2));
    }

    #[tokio::test]
    async fn find_one_and_update_sort_and_return_document() {
        let engine = MemoryEngine::new();
        let c = engine.collection("tasks");
        for e in [30, 10, 20] {
            c.insert_one(doc(json!({ "enqueue": e }))).await.unwrap();
        }

        let after = c
            .find_one_and_update(
                &Filter::lte("enqueue", 25),
                &Update::new().set("enqueue", 99),
                &FindOneAndUpdateOptions::new().sort("enqueue", OrderDirection::Ascending),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after["enqueue"], json!(99));

        let before = c
            .find_one_and_update(
                &Filter::lte("enqueue", 25),
                &Update::new().set("enqueue", 98),
                &FindOneAndUpdateOptions::new().return_before(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before["enqueue"], json!(20));

        let none = c
            .find_one_and_update(
                &Filter::lte("enqueue", 25),
                &Update::new().set("enqueue", 97),
                &FindOneAndUpdateOptions::new(),
            )
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn conditional_update_admits_one_winner() {
        let engine = Arc::new(MemoryEngine::new());
        let c = engine.collection("states");
        c.insert_one(doc(json!({ "_id": "k", "lock": 0 }))).await.unwrap();

        let mut handles = Vec::new();
        for n in 1..=16 {
            let c = Arc::clone(&c);
            handles.push(tokio::spawn(async move {
                c.find_one_and_update(
                    &Filter::eq("_id", "k").and(Filter::lt("lock", 1)),
                    &Update::new().set("lock", n),
                    &FindOneAndUpdateOptions::new(),
                )
                .await
                .unwrap()
                .is_some()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn text_search_requires_text_index() {
        let engine = MemoryEngine::new();
        let c = engine.collection("states");
        c.insert_one(doc(json!({ "name": "Jane Doe" }))).await.unwrap();
        c.insert_one(doc(json!({ "name": "Jane Roe", "city": "Doe" }))).await.unwrap();

        let filter = Filter::text("doe jane");
        assert!(c.find(&filter, &FindOptions::new()).await.is_err());

        c.create_index(&IndexSpec::text_wildcard("search-text")).await.unwrap();
        let found = c
            .find(&filter, &FindOptions::new().sort_by_text_score())
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[tokio::test]
    async fn restricted_capabilities() {
        let engine = MemoryEngine::with_capabilities(Capabilities::restricted());
        let c = engine.collection("x");
        let err = c
            .create_index(&IndexSpec::new("u").asc("a").unique())
            .await
            .unwrap_err();
        assert_eq!(err.kind, DatabaseErrorKind::NotSupported);
        assert!(c.create_index(&IndexSpec::text_wildcard("t")).await.is_err());
        assert!(c.distinct("a", &Filter::All).await.is_err());
        c.create_index(&IndexSpec::new("a_1").asc("a")).await.unwrap();
        assert_eq!(c.indexes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn distinct_and_group_count_unwind_arrays() {
        let engine = MemoryEngine::new();
        let c = engine.collection("subs");
        c.insert_one(doc(json!({ "subs": ["a", "b"], "pageId": "p" }))).await.unwrap();
        c.insert_one(doc(json!({ "subs": ["b"], "pageId": "p" }))).await.unwrap();
        c.insert_one(doc(json!({ "subs": ["b", "c"], "pageId": "q" }))).await.unwrap();

        let tags = c.distinct("subs", &Filter::eq("pageId", "p")).await.unwrap();
        assert_eq!(tags, vec![json!("a"), json!("b")]);

        let groups = c.group_count(&Filter::All, "subs").await.unwrap();
        assert_eq!(groups[0], (json!("b"), 3));
        assert_eq!(groups.len(), 3);
    }

    #[tokio::test]
    async fn injected_faults_fire_the_requested_number_of_times() {
        let engine = MemoryEngine::new();
        engine.inject_fault("x", FaultOp::Insert, DatabaseErrorKind::ConnectionFailed, 2);
        let c = engine.collection("x");

        for _ in 0..2 {
            let err = c.insert_one(Document::new()).await.unwrap_err();
            assert!(err.is_network());
        }
        assert!(c.insert_one(Document::new()).await.is_ok());
        assert!(c.find(&Filter::All, &FindOptions::new()).await.is_ok());
    }

    #[tokio::test]
    async fn collections_and_indexes_lifecycle() {
        let engine = MemoryEngine::new();
        assert!(engine.list_collections().await.unwrap().is_empty());
        engine.create_collection("a").await.unwrap();
        let err = engine.create_collection("a").await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(engine.list_collections().await.unwrap(), vec!["a".to_string()]);

        let c = engine.collection("a");
        c.create_index(&IndexSpec::new("n_1").asc("n")).await.unwrap();
        assert!(c.drop_index(PRIMARY_INDEX).await.is_err());
        c.drop_index("n_1").await.unwrap();
        assert_eq!(
            c.drop_index("n_1").await.unwrap_err().kind,
            DatabaseErrorKind::NotFound
        );

        c.drop_collection().await.unwrap();
        assert!(engine.list_collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bulk_update_reports_upserted_indexes() {
        let engine = MemoryEngine::new();
        let c = engine.collection("subs");
        c.insert_one(doc(json!({ "senderId": "a", "subs": ["x"] }))).await.unwrap();

        let ops = vec![
            UpdateOne {
                filter: Filter::eq("senderId", "a"),
                update: Update::new().add_to_set("subs", ["y"]),
                upsert: true,
            },
            UpdateOne {
                filter: Filter::eq("senderId", "b"),
                update: Update::new().add_to_set("subs", ["y"]),
                upsert: true,
            },
            UpdateOne {
                filter: Filter::eq("senderId", "c"),
                update: Update::new().add_to_set("subs", ["y"]),
                upsert: false,
            },
        ];
        let outcome = c.bulk_update(&ops, false).await.unwrap();
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.upserted_ids.keys().copied().collect::<Vec<_>>(), vec![1]);
        assert_eq!(c.count(&Filter::All).await.unwrap(), 2);
    }
}
