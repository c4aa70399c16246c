//! In-memory watch store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    FindOptions, NewWatch, StoreError, Watch, WatchMeta, WatchQuery, WatchRecord, WatchStore,
    WatcherLock,
};

/// A [`WatchStore`] backed by a process-local map.
///
/// Implements the full store contract, including lease eligibility and the
/// sequence compare-and-set, so scheduler behavior against it matches a
/// database-backed deployment. Purging is explicit via
/// [`WatchStore::purge_expired`] rather than index-driven.
#[derive(Debug, Default)]
pub struct MemoryWatchStore {
    records: RwLock<HashMap<String, WatchRecord>>,
}

impl MemoryWatchStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, WatchRecord>> {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, WatchRecord>> {
        self.records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn matches(record: &WatchRecord, query: &WatchQuery) -> bool {
    if let Some(id) = &query.id {
        if record.watch.id != *id {
            return false;
        }
    }
    if let Some(expires_before) = query.expires_before {
        if record.watch.expires >= expires_before {
            return false;
        }
    }
    if let Some(lock_id) = query.watcher_lock_id {
        if record.meta.watcher_lock.as_ref().map(|lock| lock.id) != Some(lock_id) {
            return false;
        }
    }
    if let Some(lock_expires_before) = query.lock_expires_before {
        let Some(lock) = &record.meta.watcher_lock else {
            return false;
        };
        if lock.expires >= lock_expires_before {
            return false;
        }
    }
    true
}

#[async_trait]
impl WatchStore for MemoryWatchStore {
    async fn create(&self, new: NewWatch) -> Result<WatchRecord, StoreError> {
        let mut records = self.write();

        if records.contains_key(&new.id) {
            return Err(StoreError::Duplicate { id: new.id });
        }

        let now = Utc::now();
        let record = WatchRecord {
            watch: Watch {
                id: new.id.clone(),
                sequence: 0,
                watcher: new.watcher,
                value: None,
                expires: new.expires,
            },
            meta: WatchMeta {
                created: now,
                updated: now,
                watcher_lock: None,
            },
        };

        records.insert(new.id, record.clone());
        Ok(record)
    }

    async fn get(&self, id: &str) -> Result<WatchRecord, StoreError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })
    }

    async fn find(
        &self,
        query: &WatchQuery,
        options: &FindOptions,
    ) -> Result<Vec<WatchRecord>, StoreError> {
        let records = self.read();

        let mut found: Vec<WatchRecord> = records
            .values()
            .filter(|record| matches(record, query))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.watch.id.cmp(&b.watch.id));
        found.truncate(options.limit);

        Ok(found)
    }

    async fn update(&self, watch: Watch) -> Result<WatchRecord, StoreError> {
        let expected = watch.sequence.saturating_sub(1);
        let mut records = self.write();

        match records.get_mut(&watch.id) {
            Some(record)
                if watch.sequence > 0 && record.watch.sequence == expected =>
            {
                record.watch = watch;
                record.meta.updated = Utc::now();
                Ok(record.clone())
            },
            _ => Err(StoreError::InvalidState {
                id: watch.id,
                expected,
            }),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.write().remove(id);
        Ok(())
    }

    async fn mark(
        &self,
        lock: WatcherLock,
        id: Option<&str>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut records = self.write();

        if let Some(id) = id {
            return Ok(match records.get_mut(id) {
                Some(record) => {
                    record.meta.watcher_lock = Some(lock);
                    1
                },
                None => 0,
            });
        }

        let mut eligible: Vec<String> = records
            .values()
            .filter(|record| {
                record
                    .meta
                    .watcher_lock
                    .as_ref()
                    .is_none_or(|held| !held.is_active(now))
            })
            .map(|record| record.watch.id.clone())
            .collect();
        eligible.sort();
        eligible.truncate(limit);

        for id in &eligible {
            if let Some(record) = records.get_mut(id) {
                record.meta.watcher_lock = Some(lock.clone());
            }
        }

        Ok(eligible.len())
    }

    async fn purge_expired(&self, grace: chrono::Duration) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - grace;
        let mut records = self.write();

        let before = records.len();
        records.retain(|_, record| record.watch.expires >= cutoff);
        Ok(before - records.len())
    }
}
