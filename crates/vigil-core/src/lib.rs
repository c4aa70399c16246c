//! # vigil-core
//!
//! Core library for vigil - a notification substrate for long-running,
//! externally hosted exchanges whose state evolves over time.
//!
//! Applications need freshly observed snapshots of such exchanges without
//! stampeding the origin server and without each HTTP handler independently
//! re-fetching. This crate provides three cooperating mechanisms:
//!
//! - **Poll coalescing** ([`poll`]): at most one in-flight fetch per exchange,
//!   with lifecycle-aware result caching. A terminal observation is cached
//!   for much longer than a mutable one.
//! - **Durable watches** ([`watch`], [`store`]): watch intents persisted in a
//!   [`store::WatchStore`], leased to sweep workers under a short advisory
//!   lock, and re-polled on a self-tuning schedule.
//! - **Push tokens** ([`token`]): stateless HMAC-SHA-256 bearer tokens that
//!   let the origin call back into this process to trigger an immediate
//!   re-poll.
//!
//! Push is best-effort; polling is authoritative. Watch execution is
//! at-least-once with idempotent updates. Each process keeps its own poll
//! caches; the watch store is the only shared state.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use vigil_core::poll::PollCoalescer;
//! use vigil_core::store::MemoryWatchStore;
//! use vigil_core::watch::{WatchManager, WatchScheduler, WatcherRegistry, SchedulerConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryWatchStore::new());
//! let registry = Arc::new(WatcherRegistry::new());
//!
//! let manager = WatchManager::new(Arc::clone(&store) as _);
//! manager.create("https://exchanger.example/exchanges/z1Abc", "watchExchange",
//!     Duration::from_secs(300)).await?;
//!
//! let scheduler = WatchScheduler::new(
//!     Arc::clone(&store) as _, registry, SchedulerConfig::default());
//! tokio::spawn(async move { scheduler.run().await });
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod poll;
pub mod store;
pub mod token;
pub mod watch;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::ResourceClient;
    pub use crate::config::NotifyConfig;
    pub use crate::poll::{Observation, PollCoalescer, PollResult, Poller};
    pub use crate::store::{MemoryWatchStore, WatchRecord, WatchStore};
    pub use crate::token::PushTokens;
    pub use crate::watch::{
        SchedulerConfig, WatchManager, WatchScheduler, Watcher, WatcherRegistry,
    };
}

pub use config::NotifyConfig;
pub use poll::{PollCoalescer, PollResult};
pub use store::{WatchRecord, WatchStore};
pub use token::PushTokens;
pub use watch::{WatchManager, WatchScheduler};
