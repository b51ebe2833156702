//! SurrealDB document engine
//!
//! Supports runtime protocol selection via URL scheme:
//! - `ws://` / `wss://` - WebSocket connections
//! - `http://` / `https://` - HTTP connections
//! - `mem://` - In-memory database (for testing)
//!
//! Every document is stored as one record of the collection's table. The
//! record key is the document `_id` and the document body lives under the
//! `doc` field, so document fields never clash with SurrealDB's reserved
//! `id`. Filters and updates are compiled into parameterised SurrealQL.
//!
//! Single-document updates and deletes are compare-and-set: the candidate is
//! selected first, then modified with a `WHERE` clause repeating the filter.
//! If another writer got there first the statement touches nothing and the
//! selection is retried.
//!
//! Full-text indexes are not offered; index creation reports
//! `NotSupported`, which makes callers fall back to prefix search.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use super::value::values_equal;
use super::{
    BulkOutcome, Document, DocumentCollection, DocumentEngine, Filter, FilterOperator,
    FindOneAndUpdateOptions, FindOptions, IndexKey, IndexSpec, OrderDirection, ReturnDocument,
    SortKey, Update, UpdateOne, UpdateOutcome, ID_FIELD,
};
use crate::config::DatabaseConfig;
use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, DbResult};

/// SurrealDB client type alias using the `Any` engine for runtime protocol selection
pub type SurrealClient = surrealdb::Surreal<surrealdb::engine::any::Any>;

/// Attempts at a compare-and-set before reporting the document as gone
const CAS_ATTEMPTS: usize = 8;

/// [`DocumentEngine`] over a SurrealDB connection
#[derive(Clone)]
pub struct SurrealEngine {
    client: Arc<SurrealClient>,
}

impl SurrealEngine {
    /// Connect with retries as configured
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        let client = create_client(config).await?;
        Ok(Self::from_client(Arc::new(client)))
    }

    /// Wrap an existing client
    pub fn from_client(client: Arc<SurrealClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentEngine for SurrealEngine {
    async fn list_collections(&self) -> DbResult<Vec<String>> {
        let mut response = run(
            &self.client,
            DatabaseOperation::Collection,
            "INFO FOR DB".to_string(),
            Vec::new(),
        )
        .await?;
        let info: Option<Value> = response
            .take(0)
            .map_err(|e| database_error(DatabaseOperation::Collection, &e))?;
        let mut names: Vec<String> = info
            .as_ref()
            .and_then(|i| i.get("tables"))
            .and_then(Value::as_object)
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, name: &str) -> DbResult<()> {
        run(
            &self.client,
            DatabaseOperation::Collection,
            format!("DEFINE TABLE {} SCHEMALESS", ident(name)),
            Vec::new(),
        )
        .await
        .map(|_| ())
        .map_err(|e| e.add_context(name.to_string()))
    }

    fn collection(&self, name: &str) -> Arc<dyn DocumentCollection> {
        Arc::new(SurrealCollection {
            client: Arc::clone(&self.client),
            table: name.to_string(),
        })
    }
}

/// One table of a [`SurrealEngine`]
pub struct SurrealCollection {
    client: Arc<SurrealClient>,
    table: String,
}

impl SurrealCollection {
    async fn select(&self, filter: &Filter, options: &FindOptions) -> DbResult<Vec<Document>> {
        let mut query = Compiler::new(&self.table);
        let condition = query.filter(filter)?;
        let mut sql = format!(
            "SELECT * FROM type::table($tb) WHERE {}{}",
            condition,
            order_clause(&options.sort)
        );
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if options.skip > 0 {
            sql.push_str(&format!(" START {}", options.skip));
        }
        self.rows(DatabaseOperation::Query, sql, query.params).await
    }

    async fn rows(
        &self,
        operation: DatabaseOperation,
        sql: String,
        params: Vec<(String, Value)>,
    ) -> DbResult<Vec<Document>> {
        let mut response = run(&self.client, operation, sql, params)
            .await
            .map_err(|e| e.add_context(self.table.clone()))?;
        let last = response.num_statements().saturating_sub(1);
        let rows: Vec<Value> = response
            .take(last)
            .map_err(|e| database_error(operation, &e).add_context(self.table.clone()))?;
        Ok(rows.into_iter().filter_map(into_document).collect())
    }

    /// Compare-and-set update of one document, `None` when nothing matches
    async fn update_first(
        &self,
        filter: &Filter,
        update: &Update,
        sort: &[SortKey],
        return_document: ReturnDocument,
    ) -> DbResult<Option<(Document, Document)>> {
        for _ in 0..CAS_ATTEMPTS {
            let candidate = self
                .select(filter, &FindOptions { sort: sort.to_vec(), limit: Some(1), ..FindOptions::default() })
                .await?;
            let Some(before) = candidate.into_iter().next() else {
                return Ok(None);
            };
            let Some(id) = super::document_id(&before).map(str::to_string) else {
                return Ok(None);
            };

            let mut query = Compiler::new(&self.table);
            query.bind_named("id", Value::String(id));
            let assignments = query.update(update)?;
            let condition = query.filter(filter)?;
            let sql = match assignments {
                Some(set) => format!(
                    "UPDATE type::thing($tb, $id) SET {} WHERE {} RETURN {}",
                    set,
                    condition,
                    match return_document {
                        ReturnDocument::Before => "BEFORE",
                        ReturnDocument::After => "AFTER",
                    }
                ),
                None => format!("SELECT * FROM type::thing($tb, $id) WHERE {}", condition),
            };
            let returned = self.rows(DatabaseOperation::Update, sql, query.params).await?;
            if let Some(doc) = returned.into_iter().next() {
                return Ok(Some((before, doc)));
            }
        }
        Err(DatabaseError::with_context(
            DatabaseOperation::Update,
            DatabaseErrorKind::Timeout,
            "document kept changing under a conditional update",
            self.table.clone(),
        ))
    }

    async fn insert_seeded(&self, filter: &Filter, update: &Update) -> DbResult<Document> {
        let mut doc = Document::new();
        for (field, value) in filter.equality_fields() {
            super::update::set_path(&mut doc, field, value.clone())?;
        }
        update.apply(&mut doc, true)?;
        let id = self.insert_one(doc.clone()).await?;
        doc.insert(ID_FIELD.to_string(), Value::String(id));
        Ok(doc)
    }

    async fn values_of(&self, field: &str, filter: &Filter) -> DbResult<Vec<Value>> {
        let docs = self.select(filter, &FindOptions::new()).await?;
        let mut out = Vec::new();
        for doc in &docs {
            match super::value::lookup(doc, field) {
                Some(Value::Array(items)) => out.extend(items.iter().cloned()),
                Some(value) => out.push(value.clone()),
                None => {}
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DocumentCollection for SurrealCollection {
    fn name(&self) -> &str {
        &self.table
    }

    async fn indexes(&self) -> DbResult<Vec<IndexSpec>> {
        let mut response = run(
            &self.client,
            DatabaseOperation::Index,
            format!("INFO FOR TABLE {}", ident(&self.table)),
            Vec::new(),
        )
        .await?;
        let info: Option<Value> = response
            .take(0)
            .map_err(|e| database_error(DatabaseOperation::Index, &e))?;
        let mut specs = vec![IndexSpec::primary()];
        if let Some(indexes) = info
            .as_ref()
            .and_then(|i| i.get("indexes"))
            .and_then(Value::as_object)
        {
            for (name, definition) in indexes {
                specs.push(parse_index_definition(name, definition.as_str().unwrap_or_default()));
            }
        }
        Ok(specs)
    }

    async fn create_index(&self, spec: &IndexSpec) -> DbResult<()> {
        if spec.is_text() {
            return Err(DatabaseError::with_context(
                DatabaseOperation::Index,
                DatabaseErrorKind::NotSupported,
                "full-text indexes are not supported",
                spec.name.clone(),
            ));
        }
        run(
            &self.client,
            DatabaseOperation::Index,
            index_definition(&self.table, spec),
            Vec::new(),
        )
        .await
        .map(|_| ())
        .map_err(|e| e.add_context(spec.name.clone()))
    }

    async fn drop_index(&self, name: &str) -> DbResult<()> {
        run(
            &self.client,
            DatabaseOperation::Index,
            format!("REMOVE INDEX {} ON TABLE {}", ident(name), ident(&self.table)),
            Vec::new(),
        )
        .await
        .map(|_| ())
        .map_err(|e| e.add_context(name.to_string()))
    }

    async fn insert_one(&self, mut doc: Document) -> DbResult<String> {
        let id = match doc.remove(ID_FIELD) {
            Some(Value::String(id)) => id,
            _ => uuid::Uuid::now_v7().simple().to_string(),
        };
        let mut query = Compiler::new(&self.table);
        query.bind_named("id", Value::String(id.clone()));
        query.bind_named("doc", Value::Object(doc));
        run(
            &self.client,
            DatabaseOperation::Insert,
            "CREATE type::thing($tb, $id) CONTENT { doc: $doc }".to_string(),
            query.params,
        )
        .await
        .map_err(|e| e.add_context(self.table.clone()))?;
        Ok(id)
    }

    async fn find(&self, filter: &Filter, options: &FindOptions) -> DbResult<Vec<Document>> {
        let docs = self.select(filter, options).await?;
        Ok(match &options.projection {
            Some(projection) => docs.into_iter().map(|d| projection.apply(d)).collect(),
            None => docs,
        })
    }

    async fn count(&self, filter: &Filter) -> DbResult<u64> {
        let mut query = Compiler::new(&self.table);
        let condition = query.filter(filter)?;
        let sql = format!(
            "SELECT count() AS n FROM type::table($tb) WHERE {} GROUP ALL",
            condition
        );
        let mut response = run(&self.client, DatabaseOperation::Query, sql, query.params).await?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|e| database_error(DatabaseOperation::Query, &e))?;
        Ok(rows
            .first()
            .and_then(|r| r.get("n"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn find_one_and_update(
        &self,
        filter: &Filter,
        update: &Update,
        options: &FindOneAndUpdateOptions,
    ) -> DbResult<Option<Document>> {
        let found = self
            .update_first(filter, update, &options.sort, options.return_document)
            .await?;
        let doc = match found {
            Some((_, doc)) => Some(doc),
            None if options.upsert => {
                let inserted = self.insert_seeded(filter, update).await?;
                match options.return_document {
                    ReturnDocument::Before => None,
                    ReturnDocument::After => Some(inserted),
                }
            }
            None => None,
        };
        Ok(match (&options.projection, doc) {
            (Some(projection), Some(doc)) => Some(projection.apply(doc)),
            (_, doc) => doc,
        })
    }

    async fn update_one(
        &self,
        filter: &Filter,
        update: &Update,
        upsert: bool,
    ) -> DbResult<UpdateOutcome> {
        if self
            .update_first(filter, update, &[], ReturnDocument::After)
            .await?
            .is_some()
        {
            return Ok(UpdateOutcome {
                matched: 1,
                upserted_id: None,
            });
        }
        if !upsert {
            return Ok(UpdateOutcome::default());
        }
        let inserted = self.insert_seeded(filter, update).await?;
        Ok(UpdateOutcome {
            matched: 0,
            upserted_id: super::document_id(&inserted).map(str::to_string),
        })
    }

    async fn bulk_update(&self, operations: &[UpdateOne], ordered: bool) -> DbResult<BulkOutcome> {
        let mut outcome = BulkOutcome::default();
        let mut first_error = None;
        for (i, op) in operations.iter().enumerate() {
            match self.update_one(&op.filter, &op.update, op.upsert).await {
                Ok(result) => {
                    outcome.matched += result.matched;
                    if let Some(id) = result.upserted_id {
                        outcome.upserted_ids.insert(i, id);
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
        let mut query = Compiler::new(&self.table);
        let condition = query.filter(filter)?;
        let sql = format!("DELETE type::table($tb) WHERE {} RETURN BEFORE", condition);
        Ok(self.rows(DatabaseOperation::Delete, sql, query.params).await?.len() as u64)
    }

    async fn find_one_and_delete(&self, filter: &Filter) -> DbResult<Option<Document>> {
        for _ in 0..CAS_ATTEMPTS {
            let candidate = self
                .select(filter, &FindOptions::new().limit(1))
                .await?;
            let Some(id) = candidate
                .first()
                .and_then(super::document_id)
                .map(str::to_string)
            else {
                return Ok(None);
            };

            let mut query = Compiler::new(&self.table);
            query.bind_named("id", Value::String(id));
            let condition = query.filter(filter)?;
            let sql = format!(
                "DELETE type::thing($tb, $id) WHERE {} RETURN BEFORE",
                condition
            );
            let deleted = self.rows(DatabaseOperation::Delete, sql, query.params).await?;
            if let Some(doc) = deleted.into_iter().next() {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    async fn distinct(&self, field: &str, filter: &Filter) -> DbResult<Vec<Value>> {
        let mut out: Vec<Value> = Vec::new();
        for value in self.values_of(field, filter).await? {
            if !out.iter().any(|v| values_equal(v, &value)) {
                out.push(value);
            }
        }
        Ok(out)
    }

    async fn group_count(&self, filter: &Filter, field: &str) -> DbResult<Vec<(Value, u64)>> {
        let mut groups: Vec<(Value, u64)> = Vec::new();
        for value in self.values_of(field, filter).await? {
            match groups.iter_mut().find(|(v, _)| values_equal(v, &value)) {
                Some((_, count)) => *count += 1,
                None => groups.push((value, 1)),
            }
        }
        groups.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(groups)
    }

    async fn drop_collection(&self) -> DbResult<()> {
        run(
            &self.client,
            DatabaseOperation::Collection,
            format!("REMOVE TABLE IF EXISTS {}", ident(&self.table)),
            Vec::new(),
        )
        .await
        .map(|_| ())
    }
}

async fn run(
    client: &SurrealClient,
    operation: DatabaseOperation,
    sql: String,
    params: Vec<(String, Value)>,
) -> DbResult<surrealdb::Response> {
    tracing::trace!(%operation, sql = %sql, "surrealdb query");
    let mut query = client.query(sql);
    for param in params {
        query = query.bind(param);
    }
    query
        .await
        .and_then(|response| response.check())
        .map_err(|e| database_error(operation, &e))
}

/// Accumulates bound parameters while compiling filters and updates
struct Compiler {
    params: Vec<(String, Value)>,
}

impl Compiler {
    fn new(table: &str) -> Self {
        Self {
            params: vec![("tb".to_string(), Value::String(table.to_string()))],
        }
    }

    fn bind(&mut self, value: Value) -> String {
        let name = format!("p{}", self.params.len());
        self.params.push((name.clone(), value));
        format!("${}", name)
    }

    fn bind_named(&mut self, name: &str, value: Value) {
        self.params.push((name.to_string(), value));
    }

    fn filter(&mut self, filter: &Filter) -> DbResult<String> {
        Ok(match filter {
            Filter::All => "true".to_string(),
            Filter::Compare {
                field,
                operator,
                value,
            } => {
                let path = path(field);
                match operator {
                    FilterOperator::Equal => self.equals(&path, value),
                    FilterOperator::NotEqual => format!("!({})", self.equals(&path, value)),
                    ordering => {
                        let param = self.bind(value.clone());
                        format!("{} {} {}", path, ordering, param)
                    }
                }
            }
            Filter::In { field, values } => self.one_of(&path(field), values),
            Filter::NotIn { field, values } => format!("!({})", self.one_of(&path(field), values)),
            Filter::Exists { field, exists } => {
                let op = if *exists { "!=" } else { "=" };
                format!("{} {} NONE", path(field), op)
            }
            Filter::Regex { field, pattern } => {
                let path = path(field);
                let param = self.bind(Value::String(pattern.clone()));
                format!(
                    "(type::is::string({p}) AND string::matches({p}, {r}))",
                    p = path,
                    r = param
                )
            }
            Filter::Text(_) => {
                return Err(DatabaseError::not_supported(
                    DatabaseOperation::Query,
                    "full-text search is not supported",
                ))
            }
            Filter::And(parts) => self.join(parts, " AND ", "true")?,
            Filter::Or(parts) => self.join(parts, " OR ", "false")?,
        })
    }

    fn equals(&mut self, path: &str, value: &Value) -> String {
        if value.is_null() {
            return format!("({p} = NONE OR {p} = NULL)", p = path);
        }
        let param = self.bind(value.clone());
        format!(
            "({p} = {v} OR (type::is::array({p}) AND {p} CONTAINS {v}))",
            p = path,
            v = param
        )
    }

    fn one_of(&mut self, path: &str, values: &[Value]) -> String {
        let param = self.bind(Value::Array(values.to_vec()));
        format!(
            "({p} IN {v} OR (type::is::array({p}) AND {p} CONTAINSANY {v}))",
            p = path,
            v = param
        )
    }

    fn join(&mut self, parts: &[Filter], separator: &str, empty: &str) -> DbResult<String> {
        if parts.is_empty() {
            return Ok(empty.to_string());
        }
        let compiled = parts
            .iter()
            .map(|f| self.filter(f))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(format!("({})", compiled.join(separator)))
    }

    /// `SET` assignments, `None` for an empty update
    fn update(&mut self, update: &Update) -> DbResult<Option<String>> {
        let mut set = Vec::new();
        for (field, value) in &update.set {
            let param = self.bind(value.clone());
            set.push(format!("{} = {}", path(field), param));
        }
        for (field, by) in &update.inc {
            let param = self.bind(by.clone());
            set.push(format!("{p} = ({p} ?? 0) + {v}", p = path(field), v = param));
        }
        for (field, value) in &update.min {
            let param = self.bind(value.clone());
            set.push(format!(
                "{p} = IF {p} = NONE OR {v} < {p} THEN {v} ELSE {p} END",
                p = path(field),
                v = param
            ));
        }
        for field in &update.unset {
            set.push(format!("{} = NONE", path(field)));
        }
        for (field, values) in &update.add_to_set {
            let param = self.bind(Value::Array(values.clone()));
            set.push(format!(
                "{p} = array::union({p} ?? [], {v})",
                p = path(field),
                v = param
            ));
        }
        for (field, value) in &update.pull {
            let param = self.bind(json!([value]));
            set.push(format!(
                "{p} = array::complement({p} ?? [], {v})",
                p = path(field),
                v = param
            ));
        }
        for (field, values) in &update.pull_all {
            let param = self.bind(Value::Array(values.clone()));
            set.push(format!(
                "{p} = array::complement({p} ?? [], {v})",
                p = path(field),
                v = param
            ));
        }
        Ok((!set.is_empty()).then(|| set.join(", ")))
    }
}

fn order_clause(sort: &[SortKey]) -> String {
    let keys: Vec<String> = sort
        .iter()
        .filter_map(|key| match key {
            SortKey::Field(field, direction) => {
                let target = if field == ID_FIELD {
                    "id".to_string()
                } else {
                    path(field)
                };
                Some(match direction {
                    OrderDirection::Ascending => format!("{} ASC", target),
                    OrderDirection::Descending => format!("{} DESC", target),
                })
            }
            SortKey::TextScore => None,
        })
        .collect();
    if keys.is_empty() {
        String::new()
    } else {
        format!(" ORDER BY {}", keys.join(", "))
    }
}

/// SurrealQL expression for a dotted document path
fn path(field: &str) -> String {
    if field == ID_FIELD {
        return "meta::id(id)".to_string();
    }
    let mut out = String::from("doc");
    for segment in field.split('.') {
        out.push('.');
        out.push_str(&ident(segment));
    }
    out
}

/// Quote an identifier unless it is plain
fn ident(name: &str) -> String {
    let plain = !name.is_empty()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if plain {
        name.to_string()
    } else {
        format!("`{}`", name.replace('`', "\\`"))
    }
}

fn index_definition(table: &str, spec: &IndexSpec) -> String {
    let fields: Vec<String> = spec.keys.iter().map(|(field, _)| path(field)).collect();
    format!(
        "DEFINE INDEX IF NOT EXISTS {} ON TABLE {} FIELDS {}{}",
        ident(&spec.name),
        ident(table),
        fields.join(", "),
        if spec.unique { " UNIQUE" } else { "" }
    )
}

/// Rebuild an [`IndexSpec`] from a `DEFINE INDEX` statement
fn parse_index_definition(name: &str, definition: &str) -> IndexSpec {
    let mut spec = IndexSpec::new(name);
    let upper = definition.to_uppercase();
    spec.unique = upper.contains(" UNIQUE");
    let Some(start) = upper.find(" FIELDS ").or_else(|| upper.find(" COLUMNS ")) else {
        return spec;
    };
    let rest = definition[start..].trim_start();
    let rest = rest.split_once(' ').map(|(_, r)| r).unwrap_or_default();
    let end = rest.to_uppercase().find(" UNIQUE").unwrap_or(rest.len());
    for field in rest[..end].split(',') {
        let field = field.trim().trim_start_matches("doc.").replace('`', "");
        if !field.is_empty() {
            spec.keys.push((field, IndexKey::Ascending));
        }
    }
    spec
}

/// Record key of a SurrealDB record id in either serialized shape
fn record_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.rsplit_once(':').map(|(_, k)| k).unwrap_or(s).to_string()),
        Value::Object(obj) => obj.get("id").and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(inner) => inner
                .get("String")
                .and_then(|s| s.as_str().map(String::from)),
            _ => None,
        }),
        _ => None,
    }
}

fn into_document(row: Value) -> Option<Document> {
    let Value::Object(mut row) = row else {
        return None;
    };
    let id = row.get("id").and_then(record_key)?;
    let mut doc = match row.remove("doc") {
        Some(Value::Object(doc)) => doc,
        _ => Document::new(),
    };
    doc.insert(ID_FIELD.to_string(), Value::String(id));
    Some(doc)
}

fn error_kind(err: &surrealdb::Error) -> DatabaseErrorKind {
    let err_str = err.to_string().to_lowercase();
    if err_str.contains("already contains") || err_str.contains("already exists") {
        DatabaseErrorKind::DuplicateKey
    } else if err_str.contains("timeout") || err_str.contains("timed out") {
        DatabaseErrorKind::Timeout
    } else if err_str.contains("connect")
        || err_str.contains("network")
        || err_str.contains("dns")
        || err_str.contains("refused")
        || err_str.contains("closed")
    {
        DatabaseErrorKind::ConnectionFailed
    } else if err_str.contains("does not exist") || err_str.contains("not found") {
        DatabaseErrorKind::NotFound
    } else {
        DatabaseErrorKind::QueryFailed
    }
}

fn database_error(operation: DatabaseOperation, err: &surrealdb::Error) -> DatabaseError {
    DatabaseError::new(operation, error_kind(err), err.to_string())
}

/// Create a SurrealDB client with retry logic
///
/// Uses exponential backoff strategy for retries
async fn create_client(config: &DatabaseConfig) -> DbResult<SurrealClient> {
    let mut attempt = 0;
    let base_delay = Duration::from_secs(config.retry_delay_secs);

    loop {
        match try_create_client(config).await {
            Ok(client) => {
                if attempt > 0 {
                    tracing::info!(
                        "SurrealDB connection established after {} attempt(s)",
                        attempt + 1
                    );
                } else {
                    tracing::info!(
                        "SurrealDB connected: url={}, ns={}, db={}",
                        sanitize_url(&config.url),
                        config.namespace,
                        config.database
                    );
                }
                return Ok(client);
            }
            Err(e) => {
                attempt += 1;

                if attempt > config.max_retries {
                    tracing::error!(
                        "Failed to connect to SurrealDB after {} attempts: {}",
                        config.max_retries + 1,
                        e
                    );
                    return Err(e);
                }

                let delay = base_delay * 2_u32.pow(attempt.saturating_sub(1));

                tracing::warn!(
                    "SurrealDB connection attempt {} failed: {}. Retrying in {:?}...",
                    attempt,
                    e,
                    delay
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Attempt to create a SurrealDB client (single try)
async fn try_create_client(config: &DatabaseConfig) -> DbResult<SurrealClient> {
    let url_safe = sanitize_url(&config.url);
    tracing::debug!("Connecting to SurrealDB: {}", url_safe);

    let client = surrealdb::engine::any::connect(&config.url)
        .await
        .map_err(|e| {
            DatabaseError::connection_failed(
                DatabaseOperation::Connect,
                format!("{}: {}", categorize_surrealdb_error(&e), e),
            )
            .add_context(url_safe.clone())
        })?;

    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        client
            .signin(surrealdb::opt::auth::Root { username, password })
            .await
            .map_err(|e| {
                DatabaseError::connection_failed(
                    DatabaseOperation::Connect,
                    format!("{}: {}", categorize_surrealdb_error(&e), e),
                )
                .add_context(url_safe.clone())
            })?;
    }

    client
        .use_ns(&config.namespace)
        .use_db(&config.database)
        .await
        .map_err(|e| {
            DatabaseError::connection_failed(
                DatabaseOperation::Connect,
                format!(
                    "cannot select namespace '{}' / database '{}': {}",
                    config.namespace, config.database, e
                ),
            )
            .add_context(url_safe.clone())
        })?;

    Ok(client)
}

/// Sanitize connection URL for safe logging (remove credentials if present)
pub fn sanitize_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..=scheme_end + 2];
            let after_at = &url[at_pos..];
            return format!("{}***{}", scheme, after_at);
        }
    }
    url.to_string()
}

/// Categorize SurrealDB error for better user guidance
fn categorize_surrealdb_error(err: &surrealdb::Error) -> &'static str {
    let err_str = err.to_string().to_lowercase();

    if err_str.contains("auth") || err_str.contains("credentials") || err_str.contains("signin") {
        "Authentication error - check your credentials"
    } else if err_str.contains("connect")
        || err_str.contains("network")
        || err_str.contains("dns")
        || err_str.contains("refused")
    {
        "Network connection error - check connectivity"
    } else if err_str.contains("permission") || err_str.contains("denied") {
        "Permission error - check database permissions"
    } else if err_str.contains("timeout") {
        "Connection timeout - database may be overloaded"
    } else {
        "Connection error"
    }
}
