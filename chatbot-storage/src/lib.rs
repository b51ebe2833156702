//! # chatbot-storage
//!
//! Storage adapters for chatbot runtimes on a document database.
//!
//! ## Features
//!
//! - **Conversation state**: per-user optimistic lock with lease timeout and
//!   duplicate cleanup on backends without unique indexes
//! - **Audit log**: per-workspace hash chain signed with HMAC-SHA3-224,
//!   sequenced by retrying on duplicate keys
//! - **Notifications**: deduplicated delivery tasks with atomic claiming,
//!   campaigns and tag subscriptions
//! - **Provisioning**: lazy collection creation and index reconciliation per
//!   database dialect
//! - **Health**: network failures counted against a process-wide threshold
//!
//! Every adapter works on a [`DocumentEngine`](document::DocumentEngine).
//! [`MemoryEngine`](document::MemoryEngine) runs in process; the SurrealDB
//! engine is behind the `surrealdb` feature.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chatbot_storage::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config)?;
//!
//!     let engine: Arc<dyn DocumentEngine> = Arc::new(MemoryEngine::new());
//!     let health = HealthMonitor::init_global(config.health.clone());
//!
//!     let states = StateStorage::new(
//!         Arc::clone(&engine),
//!         config.dialect,
//!         Arc::clone(&health),
//!         config.state.clone(),
//!     )?;
//!     states.pre_heat().await?;
//!
//!     let record = states
//!         .get_or_create_and_lock("sender", "page", serde_json::json!({}), None)
//!         .await?;
//!     states.save_state(record).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod config;
pub mod document;
pub mod error;
pub mod health;
pub mod notifications;
pub mod observability;
pub mod pagination;
pub mod provision;
pub mod signing;
pub mod state;

pub use error::{Error, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{
        AuditCallback, AuditConfig, AuditEntry, AuditEvent, AuditLogStorage, AuditUser, EntryType,
        Level, UserVerifier,
    };

    #[cfg(feature = "jwt")]
    pub use crate::audit::JwtUserVerifier;

    pub use crate::config::{Config, HealthConfig, NotificationsConfig, StateConfig};
    pub use crate::document::{
        Document, DocumentCollection, DocumentEngine, Filter, FindOptions, IndexSpec,
        MemoryEngine, OrderDirection, Update,
    };

    #[cfg(feature = "surrealdb")]
    pub use crate::document::surreal::SurrealEngine;

    pub use crate::error::{DatabaseError, DatabaseErrorKind, DatabaseOperation, Error, Result};
    pub use crate::health::{HealthMonitor, ThresholdAction};
    pub use crate::notifications::{
        Campaign, NotificationsStorage, SubscriptionData, SubscriptionTarget, TagCount,
        TagSubscription, Task, TaskTarget, WatermarkEvent, MAX_TS,
    };
    pub use crate::observability::init_tracing;
    pub use crate::pagination::Page;
    pub use crate::provision::{Access, CollectionDescriptor, Dialect, ProvisionedCollection};
    pub use crate::state::{StateCursor, StateFilter, StateRecord, StateStorage};
}
