//! Watch lifecycle operations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::{WatchError, MAX_WATCH_TTL};
use crate::store::{NewWatch, WatchRecord, WatchStore};

/// Creates and removes durable watches.
///
/// Creation validates the requested lifetime and persists the record; the
/// registered watcher name is deliberately not checked here, since
/// registration may happen in another process sharing the store.
pub struct WatchManager {
    store: Arc<dyn WatchStore>,
}

impl WatchManager {
    /// Creates a manager over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn WatchStore>) -> Self {
        Self { store }
    }

    /// Creates a durable watch on the exchange `id`, serviced by the named
    /// watcher, expiring after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::TtlTooLong`] when `ttl` exceeds
    /// [`MAX_WATCH_TTL`], and [`crate::store::StoreError::Duplicate`] when a
    /// watch with the same id already exists.
    pub async fn create(
        &self,
        id: impl Into<String>,
        watcher: impl Into<String>,
        ttl: Duration,
    ) -> Result<WatchRecord, WatchError> {
        if ttl > MAX_WATCH_TTL {
            return Err(WatchError::TtlTooLong { requested: ttl });
        }

        let expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        let record = self
            .store
            .create(NewWatch {
                id: id.into(),
                watcher: watcher.into(),
                expires,
            })
            .await?;

        tracing::debug!(
            id = %record.watch.id,
            watcher = %record.watch.watcher,
            expires = %record.watch.expires,
            "watch created"
        );
        Ok(record)
    }

    /// Returns the watch record for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::store::StoreError::NotFound`] when no such watch
    /// exists.
    pub async fn get(&self, id: &str) -> Result<WatchRecord, WatchError> {
        Ok(self.store.get(id).await?)
    }

    /// Removes the watch for `id`. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error only on storage failure.
    pub async fn remove(&self, id: &str) -> Result<(), WatchError> {
        self.store.remove(id).await?;
        tracing::debug!(id = %id, "watch removed");
        Ok(())
    }
}
