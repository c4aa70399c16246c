//! Coalesced polling of externally hosted resources.
//!
//! The request path of the substrate: callers ask for a fresh snapshot of a
//! resource by id, and the [`PollCoalescer`] guarantees that at most one
//! fetch per id is in flight in this process at any moment. Concurrent
//! callers share the outcome of the single fetch, successes and failures
//! alike.
//!
//! Results carry a mutability flag. A result whose underlying resource can
//! still change is cached briefly; a terminal result is latched and cached
//! for much longer, and subsequent fetches short-circuit without invoking
//! the poller at all.

mod coalescer;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use coalescer::{PollCoalescer, PollCoalescerConfig, MAX_RESULT_TTL};

/// A cached snapshot of a polled resource.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResult {
    /// Resource identifier, unique within this process's caches.
    pub id: String,

    /// Monotonically increasing per-resource counter, starting at 1 and
    /// advancing on each distinct observed value.
    pub sequence: u64,

    /// Whether further polling may yield a different value. Once `false`,
    /// the result is terminal and is never overwritten by a mutable one.
    pub mutable: bool,

    /// Application-defined filtered snapshot.
    pub value: Value,
}

/// What a poller observed on a single fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// The filtered snapshot.
    pub value: Value,

    /// Whether the resource may still change.
    pub mutable: bool,
}

/// Errors surfaced by the poll path.
///
/// Cloneable so a single fetch outcome can be shared across every coalesced
/// caller.
#[derive(Debug, Clone, Error)]
pub enum PollError {
    /// The in-flight cache is at capacity and the resource has no fetch to
    /// coalesce onto.
    #[error("too many concurrent polls in flight")]
    QuotaExceeded,

    /// The shared fetch terminated without producing an outcome.
    #[error("poll for {id} did not complete")]
    Aborted {
        /// The resource whose fetch was lost.
        id: String,
    },

    /// The poller failed against the external resource.
    #[error("resource operation failed: {message}")]
    Operation {
        /// Description of the underlying failure.
        message: String,
    },
}

impl From<crate::client::ClientError> for PollError {
    fn from(err: crate::client::ClientError) -> Self {
        Self::Operation {
            message: err.to_string(),
        }
    }
}

/// Fetches a fresh observation of a resource.
///
/// Implementations must report `mutable: false` once the resource has
/// reached a terminal state, and may return a value equal to the current
/// result's value when nothing new was observed; the coalescer collapses
/// that back to the prior result without advancing the sequence.
#[async_trait]
pub trait Poller: Send + Sync {
    /// Observes the resource `id`, given the currently cached result if any.
    async fn poll(&self, id: &str, current: Option<&PollResult>)
        -> Result<Observation, PollError>;
}
