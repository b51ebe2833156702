//! Query filters for document collections
//!
//! A [`Filter`] is a backend-neutral predicate tree. Engines either evaluate
//! it directly ([`Filter::matches`], used by the in-memory engine) or compile
//! it into their own query language.
//!
//! Matching follows document-database conventions:
//!
//! - `eq(field, null)` matches documents where the field is null *or missing*
//! - a scalar condition on an array field matches when any element matches
//! - ordering comparisons between different kinds (string vs number) never match
//!
//! # Example
//!
//! ```rust
//! use chatbot_storage::document::Filter;
//! use serde_json::json;
//!
//! let filter = Filter::eq("senderId", "u1")
//!     .and(Filter::eq("pageId", "p1"))
//!     .and(Filter::lt("lock", 1_000));
//!
//! let doc = json!({ "senderId": "u1", "pageId": "p1", "lock": 0 });
//! assert!(filter.matches(doc.as_object().unwrap()).unwrap());
//! ```

use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use super::value::{bracket_cmp, lookup, values_equal};
use super::Document;
use crate::error::{DatabaseError, DatabaseOperation, DbResult};

/// Comparison operators for field conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// Equal to
    Equal,
    /// Not equal to (also matches missing fields)
    NotEqual,
    /// Greater than
    GreaterThan,
    /// Greater than or equal to
    GreaterThanOrEqual,
    /// Less than
    LessThan,
    /// Less than or equal to
    LessThanOrEqual,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => write!(f, "="),
            Self::NotEqual => write!(f, "!="),
            Self::GreaterThan => write!(f, ">"),
            Self::GreaterThanOrEqual => write!(f, ">="),
            Self::LessThan => write!(f, "<"),
            Self::LessThanOrEqual => write!(f, "<="),
        }
    }
}

/// A predicate over documents
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Filter {
    /// Matches every document
    #[default]
    All,
    /// Compare a field with a value
    Compare {
        /// Dotted field path
        field: String,
        /// Operator
        operator: FilterOperator,
        /// Right-hand side
        value: Value,
    },
    /// Field equals one of the values
    In {
        /// Dotted field path
        field: String,
        /// Candidate values
        values: Vec<Value>,
    },
    /// Field equals none of the values
    NotIn {
        /// Dotted field path
        field: String,
        /// Excluded values
        values: Vec<Value>,
    },
    /// Field presence
    Exists {
        /// Dotted field path
        field: String,
        /// Whether the field must be present
        exists: bool,
    },
    /// String field matches a regular expression
    Regex {
        /// Dotted field path
        field: String,
        /// Pattern (not anchored unless it says so)
        pattern: String,
    },
    /// Full-text search across the document, requires a text index
    Text(String),
    /// All sub-filters match
    And(Vec<Filter>),
    /// At least one sub-filter matches
    Or(Vec<Filter>),
}

impl Filter {
    fn compare(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self::Compare {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Field equals value (`null` also matches a missing field)
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, FilterOperator::Equal, value)
    }

    /// Field differs from value
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, FilterOperator::NotEqual, value)
    }

    /// Field greater than value
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, FilterOperator::GreaterThan, value)
    }

    /// Field greater than or equal to value
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, FilterOperator::GreaterThanOrEqual, value)
    }

    /// Field less than value
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, FilterOperator::LessThan, value)
    }

    /// Field less than or equal to value
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, FilterOperator::LessThanOrEqual, value)
    }

    /// Field is null or missing
    pub fn is_null(field: impl Into<String>) -> Self {
        Self::eq(field, Value::Null)
    }

    /// Field is present and not null
    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::ne(field, Value::Null)
    }

    /// Field equals any of the values
    pub fn in_values<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Field equals none of the values
    pub fn not_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::NotIn {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Field presence check
    pub fn exists(field: impl Into<String>, exists: bool) -> Self {
        Self::Exists {
            field: field.into(),
            exists,
        }
    }

    /// Regular expression match on a string field
    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Regex {
            field: field.into(),
            pattern: pattern.into(),
        }
    }

    /// Full-text search term
    pub fn text(term: impl Into<String>) -> Self {
        Self::Text(term.into())
    }

    /// Conjunction of filters
    pub fn all_of(filters: Vec<Filter>) -> Self {
        Self::And(filters)
    }

    /// Disjunction of filters
    pub fn any_of(filters: Vec<Filter>) -> Self {
        Self::Or(filters)
    }

    /// Combine with another filter, flattening nested conjunctions
    #[must_use]
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, other) => other,
            (this, Filter::All) => this,
            (Filter::And(mut left), Filter::And(right)) => {
                left.extend(right);
                Filter::And(left)
            }
            (Filter::And(mut left), other) => {
                left.push(other);
                Filter::And(left)
            }
            (this, other) => Filter::And(vec![this, other]),
        }
    }

    /// Whether this filter contains a full-text condition
    pub fn has_text(&self) -> bool {
        match self {
            Filter::Text(_) => true,
            Filter::And(filters) | Filter::Or(filters) => filters.iter().any(Filter::has_text),
            _ => false,
        }
    }

    /// The full-text term, if any
    pub fn text_term(&self) -> Option<&str> {
        match self {
            Filter::Text(term) => Some(term),
            Filter::And(filters) | Filter::Or(filters) => {
                filters.iter().find_map(Filter::text_term)
            }
            _ => None,
        }
    }

    /// Equality conditions reachable through conjunctions
    ///
    /// An upsert that inserts seeds the new document with these.
    pub fn equality_fields(&self) -> Vec<(&str, &Value)> {
        let mut out = Vec::new();
        self.collect_equalities(&mut out);
        out
    }

    fn collect_equalities<'a>(&'a self, out: &mut Vec<(&'a str, &'a Value)>) {
        match self {
            Filter::Compare {
                field,
                operator: FilterOperator::Equal,
                value,
            } => out.push((field.as_str(), value)),
            Filter::And(filters) => {
                for filter in filters {
                    filter.collect_equalities(out);
                }
            }
            _ => {}
        }
    }

    /// Evaluate the filter against a document
    pub fn matches(&self, doc: &Document) -> DbResult<bool> {
        Ok(match self {
            Filter::All => true,
            Filter::Compare {
                field,
                operator,
                value,
            } => compare_field(lookup(doc, field), *operator, value),
            Filter::In { field, values } => {
                let found = lookup(doc, field);
                values.iter().any(|v| equals_field(found, v))
            }
            Filter::NotIn { field, values } => {
                let found = lookup(doc, field);
                !values.iter().any(|v| equals_field(found, v))
            }
            Filter::Exists { field, exists } => lookup(doc, field).is_some() == *exists,
            Filter::Regex { field, pattern } => {
                let re = Regex::new(pattern).map_err(|e| {
                    DatabaseError::invalid_input(DatabaseOperation::Query, e.to_string())
                })?;
                match lookup(doc, field) {
                    Some(Value::String(s)) => re.is_match(s),
                    Some(Value::Array(items)) => items
                        .iter()
                        .any(|item| item.as_str().is_some_and(|s| re.is_match(s))),
                    _ => false,
                }
            }
            Filter::Text(term) => text_score(doc, term) > 0,
            Filter::And(filters) => {
                for filter in filters {
                    if !filter.matches(doc)? {
                        return Ok(false);
                    }
                }
                true
            }
            Filter::Or(filters) => {
                for filter in filters {
                    if filter.matches(doc)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }
}

fn equals_field(found: Option<&Value>, expected: &Value) -> bool {
    match found {
        None => expected.is_null(),
        Some(Value::Array(items)) if !expected.is_array() => {
            items.iter().any(|item| values_equal(item, expected))
        }
        Some(value) => values_equal(value, expected),
    }
}

fn compare_field(found: Option<&Value>, operator: FilterOperator, expected: &Value) -> bool {
    let accepts = |ord: Ordering| match operator {
        FilterOperator::GreaterThan => ord == Ordering::Greater,
        FilterOperator::GreaterThanOrEqual => ord != Ordering::Less,
        FilterOperator::LessThan => ord == Ordering::Less,
        FilterOperator::LessThanOrEqual => ord != Ordering::Greater,
        FilterOperator::Equal | FilterOperator::NotEqual => ord == Ordering::Equal,
    };
    match operator {
        FilterOperator::Equal => equals_field(found, expected),
        FilterOperator::NotEqual => !equals_field(found, expected),
        _ => match found {
            None => false,
            Some(Value::Array(items)) if !expected.is_array() => items
                .iter()
                .any(|item| bracket_cmp(item, expected).is_some_and(accepts)),
            Some(value) => bracket_cmp(value, expected).is_some_and(accepts),
        },
    }
}

fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

/// Relevance of a document for a full-text term
///
/// Counts how many words of the term occur as whole words in any string
/// value of the document, case-insensitively.
pub fn text_score(doc: &Document, term: &str) -> usize {
    let mut strings = Vec::new();
    for value in doc.values() {
        collect_strings(value, &mut strings);
    }
    let words: Vec<String> = strings
        .iter()
        .flat_map(|s| s.split(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    term.split_whitespace()
        .map(str::to_lowercase)
        .filter(|token| words.iter().any(|w| w == token))
        .count()
}
