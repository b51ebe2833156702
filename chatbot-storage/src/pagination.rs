//! Cursor pagination
//!
//! Listings return a [`Page`] carrying an opaque `next_cursor`. Cursors are
//! typed values serialized as JSON and encoded with standard base64, so a
//! caller can store and hand them back but cannot build a mixed one.
//!
//! ```
//! use chatbot_storage::pagination::{decode_cursor, encode_cursor};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct After { id: String }
//!
//! let cursor = encode_cursor(&After { id: "42".into() }).unwrap();
//! let back: After = decode_cursor(&cursor).unwrap();
//! assert_eq!(back.id, "42");
//! assert!(decode_cursor::<After>("%%%").is_err());
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// One page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    pub data: Vec<T>,
    /// Cursor for the next page, `None` on the last one
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Last page
    pub fn last(data: Vec<T>) -> Self {
        Self {
            data,
            next_cursor: None,
        }
    }

    /// Whether another page follows
    pub fn has_next(&self) -> bool {
        self.next_cursor.is_some()
    }

    /// Transform the items
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            data: self.data.into_iter().map(f).collect(),
            next_cursor: self.next_cursor,
        }
    }
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self::last(Vec::new())
    }
}

/// Encode a cursor value
pub fn encode_cursor<T: Serialize>(cursor: &T) -> Result<String> {
    Ok(STANDARD.encode(serde_json::to_vec(cursor)?))
}

/// Decode a cursor produced by [`encode_cursor`]
pub fn decode_cursor<T: DeserializeOwned>(cursor: &str) -> Result<T> {
    let bytes = STANDARD
        .decode(cursor)
        .map_err(|e| Error::Cursor(format!("not base64: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Cursor(format!("malformed cursor: {}", e)))
}
