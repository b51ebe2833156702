//! Hash-chained audit log storage
//!
//! Every workspace has its own chain. An entry takes the next free sequence
//! number and, when a secret is configured, a signature over its canonical
//! form chained to the signature of the entry before it.
//!
//! Sequence numbers are assigned optimistically: the unique `(wid, seq)`
//! index rejects the loser of a race, which re-reads the head of the chain
//! and tries again after a randomized, growing delay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use super::event::{AuditEntry, AuditEvent, AuditUser, EntryType, Level};
use super::AuditConfig;
use crate::document::{
    from_document, to_document, DocumentEngine, Filter, FindOptions, IndexSpec, OrderDirection,
    Projection, ID_FIELD,
};
use crate::error::{Error, Result};
use crate::health::HealthMonitor;
use crate::provision::{Access, CollectionDescriptor, Dialect, ProvisionedCollection};
use crate::signing::{sign, verify, Signable};

/// Unique index over the chain position
pub const CHAIN_INDEX: &str = "wid_1_seq_-1";

/// Receives every entry once it has been stored
///
/// Failures are logged and never reach the caller of
/// [`AuditLogStorage::log`].
#[async_trait]
pub trait AuditCallback: Send + Sync + 'static {
    /// Called with the stored entry
    async fn on_entry(&self, entry: &AuditEntry) -> Result<()>;
}

/// Checks that an entry's user id is backed by its bearer token
#[async_trait]
pub trait UserVerifier: Send + Sync + 'static {
    /// Whether `token` proves `user_id`
    async fn verify(&self, token: &str, user_id: &str, user: &AuditUser) -> bool;
}

/// Audit log over a provisioned collection
pub struct AuditLogStorage {
    collection: ProvisionedCollection,
    config: AuditConfig,
    callback: Option<Arc<dyn AuditCallback>>,
    verifier: Option<Arc<dyn UserVerifier>>,
}

impl std::fmt::Debug for AuditLogStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogStorage")
            .field("collection", &self.collection)
            .field("signed", &self.config.secret.is_some())
            .field("callback", &self.callback.is_some())
            .field("verifier", &self.verifier.is_some())
            .finish()
    }
}

impl AuditLogStorage {
    /// Audit log in `config.collection`
    ///
    /// With the `jwt` feature and `config.jwt_secret` set, entries carrying a
    /// bearer token are verified with a [`JwtUserVerifier`](super::JwtUserVerifier).
    pub fn new(
        engine: Arc<dyn DocumentEngine>,
        dialect: Dialect,
        health: Arc<HealthMonitor>,
        config: AuditConfig,
    ) -> Result<Self> {
        let mut descriptor = CollectionDescriptor::new(config.collection.clone()).index(
            IndexSpec::new(CHAIN_INDEX)
                .asc("wid")
                .desc("seq")
                .unique(),
        )?;
        match dialect {
            Dialect::Restricted => {
                descriptor.add_index(IndexSpec::new("wid_1").asc("wid"))?;
                descriptor.add_index(IndexSpec::new("seq_-1").desc("seq"))?;
            }
            Dialect::Standard => {
                descriptor.add_index(IndexSpec::new("wid_1_date_-1").asc("wid").desc("date"))?;
            }
        }

        #[cfg(feature = "jwt")]
        let verifier = config
            .jwt_secret
            .as_deref()
            .map(|secret| Arc::new(super::JwtUserVerifier::new(secret)) as Arc<dyn UserVerifier>);
        #[cfg(not(feature = "jwt"))]
        let verifier = None;

        Ok(Self {
            collection: ProvisionedCollection::new(engine, dialect, health, descriptor),
            config,
            callback: None,
            verifier,
        })
    }

    /// Call `callback` with every stored entry
    pub fn with_callback(mut self, callback: Arc<dyn AuditCallback>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Verify user tokens with `verifier` when listing
    pub fn with_user_verifier(mut self, verifier: Arc<dyn UserVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// The underlying collection
    pub fn collection(&self) -> &ProvisionedCollection {
        &self.collection
    }

    /// Append an entry to a workspace chain
    ///
    /// `workspace` defaults to the configured default workspace and `date` to
    /// now. Storage errors other than network failures are logged and the
    /// unstored entry is returned when `mute_errors` is set. Running out of
    /// retries is always an error.
    #[allow(clippy::too_many_arguments)]
    pub async fn log(
        &self,
        event: AuditEvent,
        user: AuditUser,
        meta: Map<String, Value>,
        workspace: Option<&str>,
        entry_type: EntryType,
        level: Level,
        date: Option<DateTime<Utc>>,
    ) -> Result<AuditEntry> {
        let wid = workspace.unwrap_or(&self.config.default_workspace).to_string();
        let entry = AuditEntry::new(
            event,
            user,
            meta,
            wid,
            entry_type,
            level,
            date.unwrap_or_else(Utc::now),
        );

        let stored = self.store_with_retry(entry).await?;

        if let Some(callback) = &self.callback {
            if let Err(e) = callback.on_entry(&stored).await {
                error!(workspace = %stored.wid, seq = stored.seq, error = %e, "Failed to send audit log");
            }
        }
        Ok(stored)
    }

    /// Append an informational entry of importance `Important` to the default workspace
    pub async fn log_event(&self, event: AuditEvent, user: AuditUser) -> Result<AuditEntry> {
        self.log(event, user, Map::new(), None, EntryType::Info, Level::Important, None)
            .await
    }

    async fn store_with_retry(&self, mut entry: AuditEntry) -> Result<AuditEntry> {
        let max_attempts = self.config.max_retries.max(1);
        let mut delta = 0u64;

        for attempt in 1..=max_attempts {
            let started = Instant::now();
            entry.delta = delta;

            let err = match self.store(&mut entry).await {
                Ok(()) => return Ok(entry),
                Err(e) => e,
            };

            let duplicate = err.as_database().is_some_and(|e| e.is_duplicate_key());
            if duplicate {
                if attempt >= max_attempts {
                    error!(workspace = %entry.wid, attempts = attempt, "Audit log: cannot store entry");
                    return Err(Error::RetriesExhausted { attempts: attempt });
                }
                let delay = self.retry_delay(attempt);
                debug!(
                    workspace = %entry.wid,
                    seq = entry.seq,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "audit sequence taken, retrying"
                );
                tokio::time::sleep(delay).await;
                delta += started.elapsed().as_millis() as u64;
                continue;
            }

            if err.is_network() || !self.config.mute_errors {
                return Err(err);
            }
            error!(workspace = %entry.wid, error = %err, "Audit log store error");
            return Ok(entry);
        }

        Err(Error::RetriesExhausted {
            attempts: max_attempts,
        })
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let jitter = match self.config.retry_jitter_ms {
            0 => 0,
            max => rand::rng().random_range(0..max),
        };
        self.config.retry_delay(attempt) + Duration::from_millis(jitter)
    }

    async fn store(&self, entry: &mut AuditEntry) -> Result<()> {
        let collection = self.collection.handle(Access::Write).await?;

        let previous = collection
            .find_one(
                &Filter::eq("wid", entry.wid.as_str()),
                &FindOptions::new()
                    .sort("seq", OrderDirection::Descending)
                    .projection(Projection::include(["seq", "sign"]).without_id()),
            )
            .await?;
        let previous_seq = previous
            .as_ref()
            .and_then(|doc| doc.get("seq"))
            .and_then(Value::as_u64);
        let previous_sign = previous
            .as_ref()
            .and_then(|doc| doc.get("sign"))
            .and_then(Value::as_str);

        entry.seq = previous_seq.map_or(0, |seq| seq + 1);

        let doc = match &self.config.secret {
            Some(secret) => {
                let form = entry.canonical_form();
                let signature = sign(&form, secret, previous_sign)?;
                entry.sign = Some(signature.clone());
                let Value::Object(mut doc) = form.into_value() else {
                    return Err(Error::Internal("audit entry is not an object".to_string()));
                };
                doc.insert("sign".to_string(), Value::String(signature));
                doc
            }
            None => {
                entry.sign = None;
                to_document(&*entry)?
            }
        };

        collection.insert_one(doc).await?;
        Ok(())
    }

    /// Entries of a workspace, newest first
    ///
    /// Only entries with a sequence number below `from_seq` are returned when
    /// it is given. Each entry carries `ok`: whether its signature matches the
    /// chain (`None` without a secret), and whether its bearer token proves its
    /// user id when a verifier is set.
    pub async fn list(
        &self,
        workspace: Option<&str>,
        from_seq: Option<u64>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>> {
        let wid = workspace.unwrap_or(&self.config.default_workspace);
        let limit = limit.unwrap_or(self.config.page_size);

        let mut filter = Filter::eq("wid", wid);
        if let Some(from_seq) = from_seq {
            filter = filter.and(Filter::lt("seq", from_seq));
        }

        let collection = self.collection.handle(Access::Write).await?;
        let docs = collection
            .find(
                &filter,
                &FindOptions::new()
                    .sort("seq", OrderDirection::Descending)
                    .limit(limit as u64 + 1)
                    .projection(Projection::exclude([ID_FIELD])),
            )
            .await?;
        let mut entries = docs
            .into_iter()
            .map(from_document)
            .collect::<Result<Vec<AuditEntry>>>()?;

        let len = entries.len().min(limit);
        let mut verify_users = false;
        for i in 0..len {
            let previous = entries.get(i + 1).and_then(|p| p.sign.clone());
            let entry = &mut entries[i];
            verify_users |= entry.user.is_verifiable();

            entry.ok = match &self.config.secret {
                Some(secret) => {
                    let stored = entry.sign.as_deref().unwrap_or_default();
                    let ok = verify(&entry.canonical_form(), secret, previous.as_deref(), stored);
                    if !ok {
                        error!(workspace = %entry.wid, seq = entry.seq, "Audit log: found wrong signature");
                    }
                    Some(ok)
                }
                None => None,
            };
        }
        entries.truncate(len);

        if let (true, Some(verifier)) = (verify_users, &self.verifier) {
            for entry in entries.iter_mut() {
                let (Some(id), Some(jwt)) = (&entry.user.id, &entry.user.jwt) else {
                    continue;
                };
                let checked = verifier.verify(jwt, id, &entry.user).await;
                if !checked {
                    warn!(workspace = %entry.wid, seq = entry.seq, "Audit log: user token does not match");
                }
                entry.ok = Some(entry.ok != Some(false) && checked);
            }
        }

        Ok(entries)
    }

    /// Provision the collection and wait for its indexes
    pub async fn pre_heat(&self) -> Result<()> {
        self.collection.pre_heat().await
    }

    /// Drop the collection; the next access provisions it again
    pub async fn drop_collection(&self) -> Result<()> {
        self.collection.drop_collection().await
    }
}
