//! The process-wide watcher registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use super::WatchError;
use crate::store::WatchRecord;

/// What a watcher observed for a single record.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherOutcome {
    /// The new filtered snapshot, or `None` when nothing new was observed
    /// and no update should be written.
    pub value: Option<Value>,

    /// Whether the watched resource may still change.
    pub mutable: bool,
}

/// Observes the resource behind a watch record.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Produces the next outcome for `record`.
    async fn observe(&self, record: &WatchRecord) -> Result<WatcherOutcome, WatchError>;
}

/// Maps watcher names to implementations.
///
/// Registration happens during startup; the scheduler and request handlers
/// only ever read. A watch record referring to a name that is not registered
/// is skipped at lease-execution time, not rejected at creation.
#[derive(Default)]
pub struct WatcherRegistry {
    watchers: RwLock<HashMap<String, Arc<dyn Watcher>>>,
}

impl WatcherRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `watcher` under `name`, replacing any previous entry.
    pub fn register(&self, name: impl Into<String>, watcher: Arc<dyn Watcher>) {
        let name = name.into();
        let mut watchers = self
            .watchers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if watchers.insert(name.clone(), watcher).is_some() {
            tracing::warn!(name = %name, "watcher re-registered; replacing");
        }
    }

    /// Returns the watcher registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Watcher>> {
        self.watchers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Returns the registered watcher names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.watchers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
