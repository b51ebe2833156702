//! Document model and storage engine interface
//!
//! Documents are JSON objects with a string `_id`. The [`DocumentEngine`] and
//! [`DocumentCollection`] traits describe what the adapters need from a
//! database; [`MemoryEngine`] implements them in process and the SurrealDB
//! engine (feature `surrealdb`) implements them over a real server.

mod engine;
mod filter;
mod index;
pub mod memory;
mod options;
pub mod update;
pub mod value;

#[cfg(feature = "surrealdb")]
pub mod surreal;

pub use engine::{DocumentCollection, DocumentEngine};
pub use filter::{text_score, Filter, FilterOperator};
pub use index::{IndexKey, IndexSpec, PRIMARY_INDEX};
pub use memory::{Capabilities, FaultOp, MemoryEngine};
pub use options::{
    BulkOutcome, FindOneAndUpdateOptions, FindOptions, OrderDirection, Projection, ReturnDocument,
    SortKey, UpdateOne, UpdateOutcome,
};
pub use update::Update;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A JSON document
pub type Document = Map<String, Value>;

/// Name of the identifier field
pub const ID_FIELD: &str = "_id";

/// Serialize a value into a document
pub fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Internal(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

/// Deserialize a document into a value
pub fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc))?)
}

/// The `_id` of a document
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}
