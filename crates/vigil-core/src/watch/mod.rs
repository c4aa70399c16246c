//! Durable watches and the sweep scheduler that drives them.
//!
//! A watch is a persisted intent: "keep observing this exchange with that
//! watcher". Watches survive process restarts in the [`crate::store`] and
//! are executed by a per-process [`WatchScheduler`] sweep loop:
//!
//! ```text
//! UNLEASED --mark(lease)--> LEASED --watcher(record)--> observed a value?
//!                                                          |
//!                                                          +- yes -> update(sequence + 1) -> UNLEASED
//!                                                          +- no  -> (lease expires)      -> UNLEASED
//! ```
//!
//! Execution is at-least-once: leases are advisory and short, sequence
//! conflicts are dropped rather than retried, and watchers must be
//! idempotent across repeated invocations on terminal state.
//!
//! # Error policy
//!
//! Everything the scheduler hits is logged, never rethrown; the sweep loop
//! does not terminate because of a per-record or per-sweep failure. An
//! unregistered watcher name is logged and the record's lease is left to
//! expire on its own.

mod adapter;
mod manager;
mod registry;
mod scheduler;


use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

pub use adapter::{ExchangeFilter, ExchangePoller, ExchangeWatcher, FilterContext, IdentityFilter};
pub use manager::WatchManager;
pub use registry::{Watcher, WatcherOutcome, WatcherRegistry};
pub use scheduler::{SchedulerConfig, WatchScheduler};

use crate::store::StoreError;

/// Exchange states after which no further change can be observed.
pub const TERMINAL_EXCHANGE_STATES: [&str; 2] = ["complete", "invalid"];

/// Maximum watch lifetime at creation.
pub const MAX_WATCH_TTL: Duration = Duration::from_secs(60 * 60);

/// Errors raised by the watch path.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The requested watch lifetime exceeds [`MAX_WATCH_TTL`].
    #[error("watch ttl {requested:?} exceeds the one hour maximum")]
    TtlTooLong {
        /// The rejected lifetime.
        requested: Duration,
    },

    /// The watch store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A fetch or filter against the external resource failed.
    #[error("resource operation failed: {message}")]
    Operation {
        /// Description of the underlying failure.
        message: String,
    },
}

impl From<crate::client::ClientError> for WatchError {
    fn from(err: crate::client::ClientError) -> Self {
        Self::Operation {
            message: err.to_string(),
        }
    }
}

/// Whether an exchange document has reached a terminal state.
#[must_use]
pub fn is_terminal(exchange: &Value) -> bool {
    exchange
        .get("state")
        .and_then(Value::as_str)
        .is_some_and(|state| TERMINAL_EXCHANGE_STATES.contains(&state))
}
