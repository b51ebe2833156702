//! Error types for the storage adapters
//!
//! Storage engines report failures as a structured [`DatabaseError`]. The
//! adapters lift those into the crate-wide [`Error`], deciding along the way
//! which failures are lock contention ([`Error::Conflict`]), which are muted
//! and which must reach the caller.

use std::fmt;
use thiserror::Error;

/// Stable code carried by every conflict error
///
/// Shared by the regular lock-contention path and the degraded-uniqueness
/// cleanup path so callers retry both identically.
pub const CONFLICT_CODE: u32 = 11000;

// ============================================================================
// Structured Database Errors
// ============================================================================

/// Database operation being performed when the error occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseOperation {
    /// Establishing a database connection
    Connect,
    /// Reading documents
    Query,
    /// Inserting documents
    Insert,
    /// Updating documents (including upserts)
    Update,
    /// Deleting documents
    Delete,
    /// Creating, listing or dropping indexes
    Index,
    /// Creating, listing or dropping collections
    Collection,
    /// Aggregations (distinct, grouped counts)
    Aggregate,
}

impl fmt::Display for DatabaseOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::Query => write!(f, "query"),
            Self::Insert => write!(f, "insert"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Index => write!(f, "index"),
            Self::Collection => write!(f, "collection"),
            Self::Aggregate => write!(f, "aggregate"),
        }
    }
}

/// Category of database error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseErrorKind {
    /// Failed to establish or keep a connection
    ConnectionFailed,
    /// Operation timed out
    Timeout,
    /// Unique index violated
    DuplicateKey,
    /// The backend does not support the requested operation
    NotSupported,
    /// Query execution failed
    QueryFailed,
    /// The request itself is malformed (bad path, bad regex, bad update)
    InvalidInput,
    /// Named resource (index, collection) does not exist
    NotFound,
}

impl fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed => write!(f, "connection_failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::DuplicateKey => write!(f, "duplicate_key"),
            Self::NotSupported => write!(f, "not_supported"),
            Self::QueryFailed => write!(f, "query_failed"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::NotFound => write!(f, "not_found"),
        }
    }
}

impl DatabaseErrorKind {
    /// Connection and topology failures, the ones the health monitor counts
    pub fn is_network(&self) -> bool {
        matches!(self, Self::ConnectionFailed | Self::Timeout)
    }
}

/// Structured database error with operation context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseError {
    /// The operation being performed when the error occurred
    pub operation: DatabaseOperation,
    /// The category of error
    pub kind: DatabaseErrorKind,
    /// Human-readable error message
    pub message: String,
    /// Additional context (e.g., collection or index name)
    pub context: Option<String>,
}

impl DatabaseError {
    /// Create a new database error
    pub fn new(
        operation: DatabaseOperation,
        kind: DatabaseErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: None,
        }
    }

    /// Create a new database error with context
    pub fn with_context(
        operation: DatabaseOperation,
        kind: DatabaseErrorKind,
        message: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            kind,
            message: message.into(),
            context: Some(context.into()),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::ConnectionFailed, message)
    }

    /// Create a timeout error
    pub fn timeout(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::Timeout, message)
    }

    /// Create a duplicate key error
    pub fn duplicate_key(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::DuplicateKey, message)
    }

    /// Create a not-supported error
    pub fn not_supported(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::NotSupported, message)
    }

    /// Create a query failed error
    pub fn query_failed(message: impl Into<String>) -> Self {
        Self::new(
            DatabaseOperation::Query,
            DatabaseErrorKind::QueryFailed,
            message,
        )
    }

    /// Create an invalid input error
    pub fn invalid_input(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::InvalidInput, message)
    }

    /// Create a "not found" error
    pub fn not_found(operation: DatabaseOperation, message: impl Into<String>) -> Self {
        Self::new(operation, DatabaseErrorKind::NotFound, message)
    }

    /// Whether the error comes from connectivity rather than the request
    pub fn is_network(&self) -> bool {
        self.kind.is_network()
    }

    /// Whether a unique index rejected the write
    pub fn is_duplicate_key(&self) -> bool {
        self.kind == DatabaseErrorKind::DuplicateKey
    }

    /// Add context to an existing error
    pub fn add_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Database {} error during {}: {}",
            self.kind, self.operation, self.message
        )?;
        if let Some(ref ctx) = self.context {
            write!(f, " [context: {}]", ctx)?;
        }
        Ok(())
    }
}

impl std::error::Error for DatabaseError {}

/// Result type returned by storage engines
pub type DbResult<T> = std::result::Result<T, DatabaseError>;

/// Result type alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the storage adapters
#[derive(Debug, Error)]
pub enum Error {
    /// Lock contention or a lost uniqueness race; retry later
    #[error("Conflict ({code}): {message}")]
    Conflict {
        /// Always [`CONFLICT_CODE`]
        code: u32,
        /// What was contended
        message: String,
    },

    /// Structured database error with operation context
    #[error("{0}")]
    Database(DatabaseError),

    /// Audit entry could not be sequenced within the retry budget
    #[error("Audit log: cannot store entry, retries exhausted after {attempts} attempt(s)")]
    RetriesExhausted {
        /// Attempts made, including the first
        attempts: u32,
    },

    /// Invalid setup (e.g. an index declared without a name)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration could not be loaded
    #[error("Configuration loading error: {0}")]
    Figment(Box<figment::Error>),

    /// A pagination cursor could not be decoded
    #[error("Invalid cursor: {0}")]
    Cursor(String),

    /// Document (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a conflict error carrying [`CONFLICT_CODE`]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            code: CONFLICT_CODE,
            message: message.into(),
        }
    }

    /// Whether this is a retryable conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Stable error code, present for conflicts only
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Conflict { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// The underlying database error, if any
    pub fn as_database(&self) -> Option<&DatabaseError> {
        match self {
            Self::Database(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the underlying failure is a connectivity problem
    pub fn is_network(&self) -> bool {
        self.as_database().is_some_and(DatabaseError::is_network)
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        Error::Database(err)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Figment(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_error_with_context() {
        let err = DatabaseError::with_context(
            DatabaseOperation::Insert,
            DatabaseErrorKind::DuplicateKey,
            "E11000 duplicate key",
            "auditlog.wid_1_seq_-1",
        );
        assert_eq!(err.operation, DatabaseOperation::Insert);
        assert!(err.is_duplicate_key());
        assert!(!err.is_network());
        assert_eq!(err.context.as_deref(), Some("auditlog.wid_1_seq_-1"));
    }

    #[test]
    fn test_network_kinds() {
        assert!(DatabaseErrorKind::ConnectionFailed.is_network());
        assert!(DatabaseErrorKind::Timeout.is_network());
        assert!(!DatabaseErrorKind::DuplicateKey.is_network());
        assert!(!DatabaseErrorKind::QueryFailed.is_network());
    }

    #[test]
    fn test_database_error_display() {
        let err = DatabaseError::query_failed("bad filter").add_context("states");
        assert_eq!(
            err.to_string(),
            "Database query_failed error during query: bad filter [context: states]"
        );
    }

    #[test]
    fn test_conflict_carries_stable_code() {
        let err = Error::conflict("State was locked");
        assert!(err.is_conflict());
        assert_eq!(err.code(), Some(CONFLICT_CODE));
        assert_eq!(err.code(), Some(11000));
    }

    #[test]
    fn test_duplicate_key_is_not_a_conflict_until_classified() {
        let err: Error =
            DatabaseError::duplicate_key(DatabaseOperation::Insert, "dup").into();
        assert!(!err.is_conflict());
        assert_eq!(err.code(), None);
        assert!(err.as_database().is_some_and(DatabaseError::is_duplicate_key));
    }

    #[test]
    fn test_is_network_through_crate_error() {
        let err: Error =
            DatabaseError::connection_failed(DatabaseOperation::Query, "refused").into();
        assert!(err.is_network());
        assert!(!Error::Internal("x".into()).is_network());
    }
}
