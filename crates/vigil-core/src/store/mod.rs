//! Persistent records for durable watches.
//!
//! A watch record is the only state shared between processes. The store
//! contract is deliberately small: unique ids, TTL-indexed expiry, advisory
//! watcher leases, and a compare-and-set update keyed on the record
//! sequence. A document database fits it naturally; [`MemoryWatchStore`]
//! implements the same contract in process for tests and single-node use.
//!
//! # Lease eligibility
//!
//! A record is eligible for [`WatchStore::mark`] when it has no active
//! lease: its `watcher_lock` is absent, or the lock's expiry is in the past.
//! Leases are advisory and short-lived so a crashed worker's records become
//! eligible again quickly.

mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryWatchStore;

/// Grace period before an expired record may be purged.
#[must_use]
pub fn purge_grace() -> chrono::Duration {
    chrono::Duration::hours(24)
}

/// Errors raised by watch store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A record with the same id already exists.
    #[error("watch {id} already exists")]
    Duplicate {
        /// The conflicting watch id.
        id: String,
    },

    /// No record with the given id exists.
    #[error("watch {id} not found")]
    NotFound {
        /// The missing watch id.
        id: String,
    },

    /// A conditional update did not match the stored sequence.
    #[error("watch {id} sequence conflict: expected {expected}")]
    InvalidState {
        /// The watch id whose update conflicted.
        id: String,
        /// The sequence the update expected to find in the store.
        expected: u64,
    },

    /// The backing store failed.
    #[error("watch store backend failure: {message}")]
    Backend {
        /// Backend-reported failure description.
        message: String,
    },
}

/// The durable half of a watch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Watch {
    /// Globally unique watch id; also the resource URL polled by the
    /// exchange adapters.
    pub id: String,

    /// Update counter, starting at 0. Each successful update advances it by
    /// exactly one via a conditional compare-and-set.
    pub sequence: u64,

    /// Name of the registered watcher that services this record.
    pub watcher: String,

    /// Last observed filtered snapshot, if any.
    pub value: Option<Value>,

    /// Record expiry. Expired records are purged after a grace period.
    pub expires: DateTime<Utc>,
}

/// Store-managed metadata attached to a watch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchMeta {
    /// Creation time.
    pub created: DateTime<Utc>,

    /// Last update time.
    pub updated: DateTime<Utc>,

    /// Advisory lease, present while a worker is processing the record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watcher_lock: Option<WatcherLock>,
}

/// An advisory lease on a watch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherLock {
    /// Lease id, fresh per sweep.
    pub id: Uuid,

    /// Lease expiry. An expired lease no longer protects the record.
    pub expires: DateTime<Utc>,
}

impl WatcherLock {
    /// Whether this lease still protects its record.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires > now
    }
}

/// A complete watch record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchRecord {
    /// The durable watch state.
    pub watch: Watch,

    /// Store-managed metadata.
    pub meta: WatchMeta,
}

/// Parameters for creating a fresh watch record.
#[derive(Debug, Clone)]
pub struct NewWatch {
    /// Globally unique watch id.
    pub id: String,

    /// Name of the watcher that will service the record.
    pub watcher: String,

    /// Record expiry.
    pub expires: DateTime<Utc>,
}

/// A query over watch records.
///
/// All populated dimensions must match. The supported dimensions mirror the
/// store's indices: watch id, watch expiry, lease id, and lease expiry.
#[derive(Debug, Clone, Default)]
pub struct WatchQuery {
    /// Match a single watch id.
    pub id: Option<String>,

    /// Match records expiring strictly before this instant.
    pub expires_before: Option<DateTime<Utc>>,

    /// Match records leased under this lease id.
    pub watcher_lock_id: Option<Uuid>,

    /// Match records whose lease expires strictly before this instant.
    pub lock_expires_before: Option<DateTime<Utc>>,
}

/// Options applied to [`WatchStore::find`].
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Maximum number of records to return.
    pub limit: usize,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self { limit: 10 }
    }
}

/// The persistence contract for durable watches.
#[async_trait]
pub trait WatchStore: Send + Sync {
    /// Inserts a fresh record with `sequence = 0` and no value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Duplicate`] when the id already exists.
    async fn create(&self, new: NewWatch) -> Result<WatchRecord, StoreError>;

    /// Returns the record with the given id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no such record exists.
    async fn get(&self, id: &str) -> Result<WatchRecord, StoreError>;

    /// Returns records matching the query, up to `options.limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn find(
        &self,
        query: &WatchQuery,
        options: &FindOptions,
    ) -> Result<Vec<WatchRecord>, StoreError>;

    /// Conditionally replaces the watch whose stored sequence equals
    /// `watch.sequence - 1`, the compare-and-set that makes record sequences
    /// globally monotonic.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidState`] with the expected prior sequence
    /// when the condition matches no record.
    async fn update(&self, watch: Watch) -> Result<WatchRecord, StoreError>;

    /// Removes the record with the given id. Idempotent: removing a missing
    /// record succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    /// Attaches `lock` to records as an advisory lease and returns how many
    /// records were marked.
    ///
    /// With `id` supplied, the lock is set on that one record
    /// unconditionally (limit is effectively 1). Otherwise it is set on up
    /// to `limit` eligible records: those with no lease, or whose lease has
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn mark(
        &self,
        lock: WatcherLock,
        id: Option<&str>,
        limit: usize,
    ) -> Result<usize, StoreError>;

    /// Removes records whose expiry is more than `grace` in the past,
    /// returning how many were purged.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] on storage failure.
    async fn purge_expired(&self, grace: chrono::Duration) -> Result<usize, StoreError>;
}
