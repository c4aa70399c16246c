//! Exchange-backed watcher and poller adapters.
//!
//! Both adapters share a shape: read the exchange through the capability
//! client, derive mutability from the exchange state, and reduce the raw
//! document to an application snapshot through a filter. The watcher variant
//! feeds the sweep scheduler; the poller variant feeds the request-time
//! coalescer.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{is_terminal, WatchError, Watcher, WatcherOutcome};
use crate::client::ResourceClient;
use crate::poll::{Observation, PollError, PollResult, Poller};
use crate::store::WatchRecord;

/// What the filter sees besides the raw exchange document.
///
/// Exactly one of the two fields is populated, depending on whether the
/// filter runs under the scheduler or the poll path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterContext<'a> {
    /// The watch record being serviced, on the scheduler path.
    pub record: Option<&'a WatchRecord>,

    /// The currently cached result, on the poll path.
    pub current: Option<&'a PollResult>,
}

/// Reduces a raw exchange document to the snapshot worth storing.
///
/// Returning `None` signals that nothing new was observed and no update
/// should be written.
#[async_trait]
pub trait ExchangeFilter: Send + Sync {
    /// Filters `exchange` in the given context.
    async fn filter(
        &self,
        context: FilterContext<'_>,
        exchange: &Value,
    ) -> Result<Option<Value>, WatchError>;
}

/// Passes the exchange document through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFilter;

#[async_trait]
impl ExchangeFilter for IdentityFilter {
    async fn filter(
        &self,
        _context: FilterContext<'_>,
        exchange: &Value,
    ) -> Result<Option<Value>, WatchError> {
        Ok(Some(exchange.clone()))
    }
}

/// A [`Watcher`] that re-reads an exchange and filters the result.
pub struct ExchangeWatcher {
    client: Arc<dyn ResourceClient>,
    capability: String,
    filter: Arc<dyn ExchangeFilter>,
}

impl ExchangeWatcher {
    /// Creates a watcher reading exchanges with `capability` through
    /// `client`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ResourceClient>,
        capability: impl Into<String>,
        filter: Arc<dyn ExchangeFilter>,
    ) -> Self {
        Self {
            client,
            capability: capability.into(),
            filter,
        }
    }
}

#[async_trait]
impl Watcher for ExchangeWatcher {
    async fn observe(&self, record: &WatchRecord) -> Result<WatcherOutcome, WatchError> {
        let exchange = self
            .client
            .read(&record.watch.id, &self.capability)
            .await?;
        let mutable = !is_terminal(&exchange);

        let context = FilterContext {
            record: Some(record),
            ..FilterContext::default()
        };
        match self.filter.filter(context, &exchange).await? {
            Some(value) => Ok(WatcherOutcome {
                value: Some(value),
                mutable,
            }),
            // Nothing new: report the mutability of what the record already
            // holds so the no-op outcome stays consistent with it.
            None => Ok(WatcherOutcome {
                value: None,
                mutable: record
                    .watch
                    .value
                    .as_ref()
                    .is_none_or(|value| !is_terminal(value)),
            }),
        }
    }
}

/// A [`Poller`] with the same read-and-filter shape, for the request path.
pub struct ExchangePoller {
    client: Arc<dyn ResourceClient>,
    capability: String,
    filter: Arc<dyn ExchangeFilter>,
}

impl ExchangePoller {
    /// Creates a poller reading exchanges with `capability` through
    /// `client`.
    #[must_use]
    pub fn new(
        client: Arc<dyn ResourceClient>,
        capability: impl Into<String>,
        filter: Arc<dyn ExchangeFilter>,
    ) -> Self {
        Self {
            client,
            capability: capability.into(),
            filter,
        }
    }
}

#[async_trait]
impl Poller for ExchangePoller {
    async fn poll(
        &self,
        id: &str,
        current: Option<&PollResult>,
    ) -> Result<Observation, PollError> {
        let exchange = self
            .client
            .read(id, &self.capability)
            .await
            .map_err(PollError::from)?;
        let mutable = !is_terminal(&exchange);

        let context = FilterContext {
            current,
            ..FilterContext::default()
        };
        let filtered = self
            .filter
            .filter(context, &exchange)
            .await
            .map_err(|error| PollError::Operation {
                message: error.to_string(),
            })?;

        match filtered {
            Some(value) => Ok(Observation { value, mutable }),
            // Nothing new: hand the current value back so the coalescer
            // collapses this fetch into the prior result.
            None => Ok(Observation {
                value: current.map_or(Value::Null, |current| current.value.clone()),
                mutable,
            }),
        }
    }
}
