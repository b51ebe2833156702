//! Tamper-evident audit log
//!
//! [`AuditLogStorage`] appends [`AuditEntry`] records to per-workspace
//! chains. Each entry is signed with HMAC-SHA3-224 over its canonical form
//! plus the previous entry's signature (see [`crate::signing`]), so editing
//! any stored entry breaks its verification on the next
//! [`list`](AuditLogStorage::list).
//!
//! # Example
//!
//! ```
//! use chatbot_storage::audit::{AuditConfig, AuditEvent, AuditLogStorage, AuditUser};
//! use chatbot_storage::document::MemoryEngine;
//! use chatbot_storage::health::HealthMonitor;
//! use chatbot_storage::provision::Dialect;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), chatbot_storage::Error> {
//! let config = AuditConfig { secret: Some("s3cret".into()), ..Default::default() };
//! let log = AuditLogStorage::new(
//!     Arc::new(MemoryEngine::new()),
//!     Dialect::Standard,
//!     Arc::new(HealthMonitor::noop()),
//!     config,
//! )?;
//!
//! log.log_event(AuditEvent::new("login", "success"), AuditUser::id("u1")).await?;
//! let entries = log.list(None, None, None).await?;
//! assert_eq!(entries[0].ok, Some(true));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod event;
pub mod storage;

#[cfg(feature = "jwt")]
pub mod verifier;

pub use config::AuditConfig;
pub use event::{AuditEntry, AuditEvent, AuditUser, EntryType, Level};
pub use storage::{AuditCallback, AuditLogStorage, UserVerifier, CHAIN_INDEX};

#[cfg(feature = "jwt")]
pub use verifier::JwtUserVerifier;
