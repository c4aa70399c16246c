//! Single-flight poll coalescing with a TTL'd result cache.
//!
//! Two caches act in concert:
//!
//! - The **in-flight cache** maps a resource id to the shared outcome channel
//!   of its ongoing fetch. Insertion is mutually exclusive per key, so for
//!   any id at most one poller invocation is live in this process.
//! - The **result cache** maps a resource id to its latest [`PollResult`],
//!   LRU-bounded with a per-entry TTL.
//!
//! The two are kept separate: result lifetimes outlive fetch durations, and
//! collapsing them would retain settled channels for the full result TTL.
//!
//! The fetch itself runs on a spawned task. Cancelling one coalesced caller
//! therefore never cancels the shared fetch; the remaining waiters still
//! receive its outcome.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::watch;

use super::{PollError, PollResult, Poller};
use crate::config::NotifyConfig;

/// TTL applied to terminal results, and to the terminal short-circuit
/// refresh.
pub const MAX_RESULT_TTL: Duration = Duration::from_secs(15 * 60);

type Outcome = Result<PollResult, PollError>;

/// Configuration for a [`PollCoalescer`].
#[derive(Debug, Clone)]
pub struct PollCoalescerConfig {
    /// Hard ceiling on concurrent distinct in-flight polls.
    pub max_in_flight: usize,

    /// Result cache capacity.
    pub result_capacity: usize,

    /// TTL for cached mutable results. Terminal results use
    /// [`MAX_RESULT_TTL`] instead.
    pub result_ttl: Duration,
}

impl Default for PollCoalescerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 10_000,
            result_capacity: 100,
            result_ttl: Duration::from_secs(30),
        }
    }
}

impl From<&NotifyConfig> for PollCoalescerConfig {
    fn from(config: &NotifyConfig) -> Self {
        Self {
            max_in_flight: config.caches.poll.max,
            result_capacity: config.caches.poll_result.max,
            result_ttl: config.caches.poll_result.ttl,
        }
    }
}

struct CachedResult {
    result: PollResult,
    expires_at: Instant,
}

struct Inner {
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<Outcome>>>>,
    results: Mutex<LruCache<String, CachedResult>>,
    max_in_flight: usize,
    result_ttl: Duration,
}

/// Deduplicates concurrent fetches per resource id and caches their results
/// with mutability-aware TTLs.
pub struct PollCoalescer {
    inner: Arc<Inner>,
}

impl PollCoalescer {
    /// Creates a coalescer with the given configuration.
    #[must_use]
    pub fn new(config: PollCoalescerConfig) -> Self {
        let capacity = NonZeroUsize::new(config.result_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(Inner {
                in_flight: Mutex::new(HashMap::new()),
                results: Mutex::new(LruCache::new(capacity)),
                max_in_flight: config.max_in_flight,
                result_ttl: config.result_ttl,
            }),
        }
    }

    /// Creates a coalescer from the substrate configuration.
    #[must_use]
    pub fn from_config(config: &NotifyConfig) -> Self {
        Self::new(PollCoalescerConfig::from(config))
    }

    /// Polls the resource `id`, coalescing with any fetch already in flight.
    ///
    /// With `use_cache` set, a live cached result is returned without
    /// touching the poller. Without it, the fetch path still consults the
    /// cache for terminal short-circuiting and sequence continuity, but a
    /// live mutable result does not suppress the fetch.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::QuotaExceeded`] when the in-flight cache is at
    /// capacity and no fetch for `id` exists to coalesce onto. Poller
    /// failures propagate to every coalesced caller.
    pub async fn poll(
        &self,
        id: &str,
        poller: Arc<dyn Poller>,
        use_cache: bool,
    ) -> Result<PollResult, PollError> {
        if use_cache {
            if let Some(result) = self.inner.live_result(id) {
                return Ok(result);
            }
        }

        let mut rx = {
            let mut in_flight = lock(&self.inner.in_flight);

            if let Some(rx) = in_flight.get(id) {
                rx.clone()
            } else {
                if in_flight.len() >= self.inner.max_in_flight {
                    tracing::warn!(
                        id = %id,
                        in_flight = in_flight.len(),
                        max = self.inner.max_in_flight,
                        "poll cache saturated"
                    );
                    return Err(PollError::QuotaExceeded);
                }

                let (tx, rx) = watch::channel(None);
                in_flight.insert(id.to_string(), rx.clone());

                let inner = Arc::clone(&self.inner);
                let id = id.to_string();
                tokio::spawn(async move {
                    // Releases the in-flight entry on every settle path,
                    // including an unwinding poller.
                    let _guard = FlightGuard {
                        inner: Arc::clone(&inner),
                        id: id.clone(),
                    };
                    let outcome = fetch(&inner, &id, poller).await;
                    let _ = tx.send(Some(outcome));
                });

                rx
            }
        };

        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().ok_or_else(|| PollError::Aborted {
                id: id.to_string(),
            })?,
            Err(_) => Err(PollError::Aborted {
                id: id.to_string(),
            }),
        };
        result
    }

    /// Returns the number of fetches currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }
}

struct FlightGuard {
    inner: Arc<Inner>,
    id: String,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.id);
    }
}

/// The uncached fetch path, run on the shared task for a resource id.
async fn fetch(inner: &Arc<Inner>, id: &str, poller: Arc<dyn Poller>) -> Outcome {
    let current = inner.current_result(id);

    // Terminal short-circuit: once a resource stops changing, re-fetching
    // cannot observe anything new. Refresh the TTL and hand back the latch.
    if let Some(current) = &current {
        if !current.mutable {
            inner.store_result(current.clone());
            return Ok(current.clone());
        }
    }

    let sequence = current.as_ref().map_or(0, |c| c.sequence);
    let observation = poller.poll(id, current.as_ref()).await?;

    let result = match current {
        Some(current)
            if observation.value == current.value && observation.mutable == current.mutable =>
        {
            // Nothing new observed; keep the prior result and sequence.
            current
        },
        _ => PollResult {
            id: id.to_string(),
            sequence: sequence + 1,
            mutable: observation.mutable,
            value: observation.value,
        },
    };

    inner.store_result(result.clone());
    Ok(result)
}

impl Inner {
    /// Returns the cached result for `id` if its TTL has not elapsed,
    /// evicting it otherwise.
    fn live_result(&self, id: &str) -> Option<PollResult> {
        let mut results = lock(&self.results);
        let state = results
            .get(id)
            .map(|entry| (entry.expires_at > Instant::now(), entry.result.clone()));

        match state {
            Some((true, result)) => Some(result),
            Some((false, _)) => {
                results.pop(id);
                None
            },
            None => None,
        }
    }

    /// Returns the cached result for `id` regardless of TTL. The fetch path
    /// uses this for sequence continuity and terminal latching.
    fn current_result(&self, id: &str) -> Option<PollResult> {
        lock(&self.results)
            .get(id)
            .map(|entry| entry.result.clone())
    }

    fn store_result(&self, result: PollResult) {
        let ttl = if result.mutable {
            self.result_ttl
        } else {
            MAX_RESULT_TTL
        };

        let mut results = lock(&self.results);

        // A terminal result is never overwritten by a mutable one.
        if let Some(existing) = results.peek(&result.id) {
            if !existing.result.mutable && result.mutable {
                return;
            }
        }

        results.put(
            result.id.clone(),
            CachedResult {
                result,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::poll::Observation;

    /// Poller that returns a fixed sequence of observations, counting calls.
    struct ScriptedPoller {
        calls: AtomicUsize,
        delay: Duration,
        script: Vec<Observation>,
    }

    impl ScriptedPoller {
        fn new(script: Vec<Observation>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                script,
            })
        }

        fn with_delay(script: Vec<Observation>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
                script,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Poller for ScriptedPoller {
        async fn poll(
            &self,
            _id: &str,
            _current: Option<&PollResult>,
        ) -> Result<Observation, PollError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.script[call.min(self.script.len() - 1)].clone())
        }
    }

    /// Poller that never completes.
    struct HangingPoller;

    #[async_trait]
    impl Poller for HangingPoller {
        async fn poll(
            &self,
            _id: &str,
            _current: Option<&PollResult>,
        ) -> Result<Observation, PollError> {
            std::future::pending().await
        }
    }

    /// Poller that always fails after a short delay.
    struct FailingPoller {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Poller for FailingPoller {
        async fn poll(
            &self,
            _id: &str,
            _current: Option<&PollResult>,
        ) -> Result<Observation, PollError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PollError::Operation {
                message: "exchange endpoint returned 502".into(),
            })
        }
    }

    fn pending() -> Observation {
        Observation {
            value: json!({"state": "pending"}),
            mutable: true,
        }
    }

    fn complete() -> Observation {
        Observation {
            value: json!({"state": "complete"}),
            mutable: false,
        }
    }

    #[tokio::test]
    async fn test_concurrent_polls_coalesce_to_one_fetch() {
        let coalescer = Arc::new(PollCoalescer::new(PollCoalescerConfig::default()));
        let poller =
            ScriptedPoller::with_delay(vec![pending()], Duration::from_millis(50));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let poller = Arc::clone(&poller) as Arc<dyn Poller>;
                tokio::spawn(async move { coalescer.poll("X", poller, true).await })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.sequence, 1);
            assert!(result.mutable);
            assert_eq!(result.value, json!({"state": "pending"}));
        }

        assert_eq!(poller.calls(), 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_repeated_cached_polls_invoke_poller_once() {
        let coalescer = PollCoalescer::new(PollCoalescerConfig::default());
        let poller = ScriptedPoller::new(vec![pending()]);

        for _ in 0..5 {
            let result = coalescer
                .poll("X", Arc::clone(&poller) as _, true)
                .await
                .unwrap();
            assert_eq!(result.sequence, 1);
        }

        assert_eq!(poller.calls(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_value_does_not_advance_sequence() {
        let coalescer = PollCoalescer::new(PollCoalescerConfig::default());
        let poller = ScriptedPoller::new(vec![pending(), pending()]);

        let first = coalescer
            .poll("X", Arc::clone(&poller) as _, false)
            .await
            .unwrap();
        let second = coalescer
            .poll("X", Arc::clone(&poller) as _, false)
            .await
            .unwrap();

        assert_eq!(poller.calls(), 2);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_distinct_values_advance_sequence() {
        let coalescer = PollCoalescer::new(PollCoalescerConfig::default());
        let poller = ScriptedPoller::new(vec![
            Observation {
                value: json!({"state": "pending", "step": 1}),
                mutable: true,
            },
            Observation {
                value: json!({"state": "pending", "step": 2}),
                mutable: true,
            },
        ]);

        let first = coalescer
            .poll("X", Arc::clone(&poller) as _, false)
            .await
            .unwrap();
        let second = coalescer
            .poll("X", Arc::clone(&poller) as _, false)
            .await
            .unwrap();

        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn test_terminal_result_short_circuits_poller() {
        let coalescer = PollCoalescer::new(PollCoalescerConfig::default());

        let first = ScriptedPoller::new(vec![pending()]);
        let result = coalescer
            .poll("X", Arc::clone(&first) as _, true)
            .await
            .unwrap();
        assert!(result.mutable);

        let second = ScriptedPoller::new(vec![complete()]);
        let result = coalescer
            .poll("X", Arc::clone(&second) as _, false)
            .await
            .unwrap();
        assert_eq!(result.sequence, 2);
        assert!(!result.mutable);

        // Further polls, cached or not, never reach the poller again.
        let third = ScriptedPoller::new(vec![pending()]);
        let cached = coalescer
            .poll("X", Arc::clone(&third) as _, true)
            .await
            .unwrap();
        let uncached = coalescer
            .poll("X", Arc::clone(&third) as _, false)
            .await
            .unwrap();

        assert_eq!(third.calls(), 0);
        assert!(!cached.mutable);
        assert!(!uncached.mutable);
        assert_eq!(cached.value, json!({"state": "complete"}));
        assert_eq!(uncached.sequence, 2);
    }

    #[tokio::test]
    async fn test_quota_exceeded_when_in_flight_cache_full() {
        let coalescer = Arc::new(PollCoalescer::new(PollCoalescerConfig {
            max_in_flight: 2,
            ..Default::default()
        }));

        for id in ["A", "B"] {
            let coalescer = Arc::clone(&coalescer);
            tokio::spawn(async move {
                let _ = coalescer.poll(id, Arc::new(HangingPoller), true).await;
            });
        }

        // Let both hanging fetches register.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coalescer.in_flight(), 2);

        let result = coalescer.poll("C", Arc::new(HangingPoller), true).await;
        assert!(matches!(result, Err(PollError::QuotaExceeded)));
    }

    #[tokio::test]
    async fn test_coalescing_still_allowed_at_quota() {
        let coalescer = Arc::new(PollCoalescer::new(PollCoalescerConfig {
            max_in_flight: 1,
            ..Default::default()
        }));

        let poller =
            ScriptedPoller::with_delay(vec![pending()], Duration::from_millis(50));

        let first = {
            let coalescer = Arc::clone(&coalescer);
            let poller = Arc::clone(&poller) as Arc<dyn Poller>;
            tokio::spawn(async move { coalescer.poll("X", poller, true).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;

        // Same id coalesces onto the existing fetch instead of being
        // rejected for capacity.
        let second = coalescer
            .poll("X", Arc::clone(&poller) as _, true)
            .await
            .unwrap();

        assert_eq!(first.await.unwrap().unwrap(), second);
        assert_eq!(poller.calls(), 1);
    }

    #[tokio::test]
    async fn test_failure_shared_and_entry_released() {
        let coalescer = Arc::new(PollCoalescer::new(PollCoalescerConfig::default()));
        let failing = Arc::new(FailingPoller {
            calls: AtomicUsize::new(0),
        });

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let coalescer = Arc::clone(&coalescer);
                let poller = Arc::clone(&failing) as Arc<dyn Poller>;
                tokio::spawn(async move { coalescer.poll("X", poller, true).await })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(PollError::Operation { .. })));
        }
        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);

        // The failed fetch released its entry; a fresh poll succeeds.
        let poller = ScriptedPoller::new(vec![pending()]);
        let result = coalescer
            .poll("X", Arc::clone(&poller) as _, true)
            .await
            .unwrap();
        assert_eq!(result.sequence, 1);
        assert_eq!(coalescer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_expired_cache_entry_refetches() {
        let coalescer = PollCoalescer::new(PollCoalescerConfig {
            result_ttl: Duration::from_millis(10),
            ..Default::default()
        });
        let poller = ScriptedPoller::new(vec![pending(), pending()]);

        coalescer
            .poll("X", Arc::clone(&poller) as _, true)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let result = coalescer
            .poll("X", Arc::clone(&poller) as _, true)
            .await
            .unwrap();

        assert_eq!(poller.calls(), 2);
        // Same observed value: the sequence does not advance.
        assert_eq!(result.sequence, 1);
    }

    #[tokio::test]
    async fn test_result_cache_capacity_bounded() {
        let coalescer = PollCoalescer::new(PollCoalescerConfig {
            result_capacity: 2,
            ..Default::default()
        });

        for id in ["A", "B", "C"] {
            let poller = ScriptedPoller::new(vec![pending()]);
            coalescer.poll(id, poller as _, true).await.unwrap();
        }

        // "A" was evicted; polling it again invokes the poller afresh.
        let poller = ScriptedPoller::new(vec![pending()]);
        let result = coalescer
            .poll("A", Arc::clone(&poller) as _, true)
            .await
            .unwrap();
        assert_eq!(poller.calls(), 1);
        assert_eq!(result.sequence, 1);
    }
}
