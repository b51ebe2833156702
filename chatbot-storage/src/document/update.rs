//! Update operators for document collections
//!
//! Operators are applied in a fixed order: set-on-insert (inserts only),
//! set, increment, minimum, unset, add-to-set, pull, pull-all. Paths are
//! dotted and intermediate objects are created on demand.

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

use super::value::{total_cmp, values_equal};
use super::Document;
use crate::error::{DatabaseError, DatabaseOperation, DbResult};

/// A set of update operators
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    pub(crate) set: Vec<(String, Value)>,
    pub(crate) set_on_insert: Vec<(String, Value)>,
    pub(crate) inc: Vec<(String, Value)>,
    pub(crate) min: Vec<(String, Value)>,
    pub(crate) unset: Vec<String>,
    pub(crate) add_to_set: Vec<(String, Vec<Value>)>,
    pub(crate) pull: Vec<(String, Value)>,
    pub(crate) pull_all: Vec<(String, Vec<Value>)>,
}

impl Update {
    /// Empty update
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field
    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set.push((path.into(), value.into()));
        self
    }

    /// Set every top-level field of a document
    #[must_use]
    pub fn set_all(mut self, fields: Document) -> Self {
        self.set.extend(fields);
        self
    }

    /// Set a field only when the update inserts a new document
    #[must_use]
    pub fn set_on_insert(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_on_insert.push((path.into(), value.into()));
        self
    }

    /// Set every top-level field of a document, on insert only
    #[must_use]
    pub fn set_on_insert_all(mut self, fields: Document) -> Self {
        self.set_on_insert.extend(fields);
        self
    }

    /// Add a number to a field (missing fields start at zero)
    #[must_use]
    pub fn inc(mut self, path: impl Into<String>, by: impl Into<Value>) -> Self {
        self.inc.push((path.into(), by.into()));
        self
    }

    /// Replace the field when the value is smaller (or the field is missing)
    #[must_use]
    pub fn min(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.min.push((path.into(), value.into()));
        self
    }

    /// Remove a field
    #[must_use]
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.unset.push(path.into());
        self
    }

    /// Append values to an array field, skipping ones already present
    #[must_use]
    pub fn add_to_set<I, V>(mut self, path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.add_to_set
            .push((path.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Remove every occurrence of a value from an array field
    #[must_use]
    pub fn pull(mut self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pull.push((path.into(), value.into()));
        self
    }

    /// Remove every occurrence of any of the values from an array field
    #[must_use]
    pub fn pull_all<I, V>(mut self, path: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.pull_all
            .push((path.into(), values.into_iter().map(Into::into).collect()));
        self
    }

    /// Whether no operator is set
    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
            && self.set_on_insert.is_empty()
            && self.inc.is_empty()
            && self.min.is_empty()
            && self.unset.is_empty()
            && self.add_to_set.is_empty()
            && self.pull.is_empty()
            && self.pull_all.is_empty()
    }

    /// Apply the operators to a document in place
    ///
    /// `inserting` enables the set-on-insert operators. On error the document
    /// may be partially modified; engines apply updates to a copy.
    pub fn apply(&self, doc: &mut Document, inserting: bool) -> DbResult<()> {
        if inserting {
            for (path, value) in &self.set_on_insert {
                set_path(doc, path, value.clone())?;
            }
        }
        for (path, value) in &self.set {
            set_path(doc, path, value.clone())?;
        }
        for (path, by) in &self.inc {
            let next = match get_path(doc, path) {
                None | Some(Value::Null) => by.clone(),
                Some(current) => add_numbers(current, by, path)?,
            };
            set_path(doc, path, next)?;
        }
        for (path, value) in &self.min {
            let replace = match get_path(doc, path) {
                None => true,
                Some(current) => total_cmp(value, current) == Ordering::Less,
            };
            if replace {
                set_path(doc, path, value.clone())?;
            }
        }
        for path in &self.unset {
            remove_path(doc, path);
        }
        for (path, values) in &self.add_to_set {
            let mut items = match get_path(doc, path) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(items)) => items.clone(),
                Some(_) => return Err(not_an_array(path)),
            };
            for value in values {
                if !items.iter().any(|item| values_equal(item, value)) {
                    items.push(value.clone());
                }
            }
            set_path(doc, path, Value::Array(items))?;
        }
        for (path, value) in &self.pull {
            pull_values(doc, path, std::slice::from_ref(value))?;
        }
        for (path, values) in &self.pull_all {
            pull_values(doc, path, values)?;
        }
        Ok(())
    }
}

fn not_an_array(path: &str) -> DatabaseError {
    DatabaseError::invalid_input(
        DatabaseOperation::Update,
        format!("field '{}' is not an array", path),
    )
}

fn pull_values(doc: &mut Document, path: &str, values: &[Value]) -> DbResult<()> {
    let items = match get_path(doc, path) {
        None | Some(Value::Null) => return Ok(()),
        Some(Value::Array(items)) => items.clone(),
        Some(_) => return Err(not_an_array(path)),
    };
    let kept: Vec<Value> = items
        .into_iter()
        .filter(|item| !values.iter().any(|v| values_equal(item, v)))
        .collect();
    set_path(doc, path, Value::Array(kept))
}

fn add_numbers(current: &Value, by: &Value, path: &str) -> DbResult<Value> {
    let invalid = || {
        DatabaseError::invalid_input(
            DatabaseOperation::Update,
            format!("cannot increment non-numeric field '{}'", path),
        )
    };
    let (Value::Number(a), Value::Number(b)) = (current, by) else {
        return Err(invalid());
    };
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Value::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum).map(Value::Number).ok_or_else(invalid)
}

fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    super::value::lookup(doc, path)
}

/// Set a value at a dotted path, creating intermediate objects
pub fn set_path(doc: &mut Document, path: &str, value: Value) -> DbResult<()> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop().unwrap_or(path);
    let mut current = doc;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.is_null() {
            *entry = Value::Object(Map::new());
        }
        current = entry.as_object_mut().ok_or_else(|| {
            DatabaseError::invalid_input(
                DatabaseOperation::Update,
                format!("cannot create field '{}' inside a non-object", path),
            )
        })?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Remove the value at a dotted path, if present
pub fn remove_path(doc: &mut Document, path: &str) -> Option<Value> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let last = parts.pop()?;
    let mut current = doc;
    for part in parts {
        current = current.get_mut(part)?.as_object_mut()?;
    }
    current.remove(last)
}
