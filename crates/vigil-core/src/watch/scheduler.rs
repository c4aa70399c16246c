//! The periodic sweep that leases and executes watches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::{WatchError, Watcher, WatcherRegistry};
use crate::store::{FindOptions, StoreError, WatchQuery, WatchRecord, WatchStore, WatcherLock};

/// Configuration for a [`WatchScheduler`].
///
/// The lease and delay settings double as the deterministic test hooks:
/// driving the scheduler with a zero lease lifetime and a short base delay
/// removes all timing dependence from sweep tests.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a sweep's advisory lease protects each record.
    pub lease_ttl: Duration,

    /// Reschedule delay after a productive sweep, and the baseline the
    /// empty-sweep back-off doubles from.
    pub base_delay: Duration,

    /// Upper bound on the empty-sweep back-off.
    pub max_delay: Duration,

    /// Maximum records leased per sweep; also the sweep's parallelism bound.
    pub batch_limit: usize,

    /// Run an expired-record purge every this many sweeps.
    pub purge_interval: u64,

    /// Grace period handed to the purge.
    pub purge_grace: chrono::Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(5),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            batch_limit: 10,
            purge_interval: 1000,
            purge_grace: crate::store::purge_grace(),
        }
    }
}

impl SchedulerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the lease lifetime.
    #[must_use]
    pub const fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Sets the baseline reschedule delay.
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the back-off cap.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the per-sweep lease limit.
    #[must_use]
    pub const fn with_batch_limit(mut self, batch_limit: usize) -> Self {
        self.batch_limit = batch_limit;
        self
    }
}

/// Per-process sweep loop over the shared watch store.
///
/// Cross-process coordination happens solely through store leases; within a
/// sweep, leased records are processed concurrently up to the batch limit.
pub struct WatchScheduler {
    config: SchedulerConfig,
    store: Arc<dyn WatchStore>,
    registry: Arc<WatcherRegistry>,
    shutdown: Arc<AtomicBool>,
}

impl WatchScheduler {
    /// Creates a scheduler over the given store and registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn WatchStore>,
        registry: Arc<WatcherRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle for requesting shutdown.
    ///
    /// An in-flight sweep completes; the loop is simply not rescheduled.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the sweep loop until shutdown is requested.
    ///
    /// Every failure is logged and absorbed; the loop never terminates on
    /// its own.
    #[allow(clippy::cast_possible_truncation)] // delays are far below u64::MAX ms
    pub async fn run(&self) {
        tracing::info!(
            lease_ttl_ms = self.config.lease_ttl.as_millis() as u64,
            base_delay_ms = self.config.base_delay.as_millis() as u64,
            batch_limit = self.config.batch_limit,
            "watch scheduler starting"
        );

        let mut delay = self.config.base_delay;
        let mut sweep_count: u64 = 0;

        while !self.shutdown.load(Ordering::Relaxed) {
            let marked = match self.sweep().await {
                Ok(marked) => marked,
                Err(error) => {
                    tracing::warn!(error = %error, "watch sweep failed");
                    0
                },
            };

            delay = self.next_delay(marked, delay);

            sweep_count = sweep_count.wrapping_add(1);
            if sweep_count % self.config.purge_interval == 0 {
                match self.store.purge_expired(self.config.purge_grace).await {
                    Ok(0) => {},
                    Ok(purged) => tracing::info!(purged, "purged expired watches"),
                    Err(error) => tracing::warn!(error = %error, "watch purge failed"),
                }
            }

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        tracing::info!("watch scheduler shutting down");
    }

    /// Executes one sweep tick: lease up to the batch limit of eligible
    /// records under a fresh lease id, then run their watchers in parallel.
    ///
    /// Returns the number of records leased, which drives rescheduling.
    ///
    /// # Errors
    ///
    /// Returns an error when leasing or fetching leased records fails.
    /// Per-record failures are logged and absorbed.
    pub async fn sweep(&self) -> Result<usize, WatchError> {
        let lease = WatcherLock {
            id: Uuid::new_v4(),
            expires: Utc::now()
                + chrono::Duration::from_std(self.config.lease_ttl).unwrap_or_default(),
        };

        let marked = self
            .store
            .mark(lease.clone(), None, self.config.batch_limit)
            .await?;
        if marked == 0 {
            return Ok(0);
        }
        tracing::debug!(lease = %lease.id, marked, "leased watch records");

        let records = self
            .store
            .find(
                &WatchQuery {
                    watcher_lock_id: Some(lease.id),
                    ..WatchQuery::default()
                },
                &FindOptions {
                    limit: self.config.batch_limit,
                },
            )
            .await?;

        let mut tasks = JoinSet::new();
        for record in records {
            let Some(watcher) = self.registry.get(&record.watch.watcher) else {
                tracing::warn!(
                    id = %record.watch.id,
                    watcher = %record.watch.watcher,
                    "watcher not registered; leaving lease to expire"
                );
                continue;
            };

            let store = Arc::clone(&self.store);
            tasks.spawn(async move { run_record(store, watcher, record).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                tracing::warn!(error = %error, "watch task panicked");
            }
        }

        Ok(marked)
    }

    /// Computes the delay before the next sweep.
    ///
    /// A saturated sweep reschedules immediately; an empty sweep doubles the
    /// previous delay from the baseline up to the configured cap; anything
    /// in between returns to the baseline.
    fn next_delay(&self, marked: usize, previous: Duration) -> Duration {
        if marked >= self.config.batch_limit {
            Duration::ZERO
        } else if marked == 0 {
            (previous.max(self.config.base_delay) * 2).min(self.config.max_delay)
        } else {
            self.config.base_delay
        }
    }
}

/// Runs one leased record to completion: invoke its watcher and write back
/// any observed value under the sequence compare-and-set.
async fn run_record(store: Arc<dyn WatchStore>, watcher: Arc<dyn Watcher>, record: WatchRecord) {
    let outcome = match watcher.observe(&record).await {
        Ok(outcome) => outcome,
        Err(error) => {
            tracing::warn!(id = %record.watch.id, error = %error, "watcher failed");
            return;
        },
    };

    let Some(value) = outcome.value else {
        tracing::debug!(id = %record.watch.id, "no update observed");
        return;
    };

    let mut next = record.watch;
    next.sequence += 1;
    next.value = Some(value);
    let id = next.id.clone();

    match store.update(next).await {
        Ok(updated) => tracing::debug!(
            id = %id,
            sequence = updated.watch.sequence,
            mutable = outcome.mutable,
            "watch updated"
        ),
        Err(StoreError::InvalidState { expected, .. }) => {
            // A concurrent sweep won the write; the next sweep observes the
            // new sequence.
            tracing::debug!(id = %id, expected, "watch update lost sequence race");
        },
        Err(error) => tracing::warn!(id = %id, error = %error, "watch update failed"),
    }
}
