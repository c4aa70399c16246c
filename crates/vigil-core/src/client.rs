//! Capability-bearing resource client abstraction.
//!
//! The substrate never talks to the origin server directly; it goes through
//! a [`ResourceClient`] supplied by the application. The concrete client is
//! expected to perform HTTPS requests with a capability-bearing authorization
//! header, but its transport is opaque here. Failures are wrapped into
//! operation errors by the adapters in [`crate::watch`].

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// A failure reported by the external resource client.
///
/// The substrate treats the client as opaque; the message is whatever the
/// concrete client chose to report.
#[derive(Debug, Clone, Error)]
#[error("resource client request failed: {message}")]
pub struct ClientError {
    /// Client-reported failure description.
    pub message: String,
}

impl ClientError {
    /// Creates a client error from any displayable cause.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Read/write access to externally hosted resources.
///
/// `capability` is an opaque authorization credential; the client decides how
/// to attach it to the request.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Reads the resource at `url`.
    async fn read(&self, url: &str, capability: &str) -> Result<Value, ClientError>;

    /// Writes `body` to the resource at `url`, returning the response body.
    async fn write(&self, url: &str, capability: &str, body: &Value)
        -> Result<Value, ClientError>;
}
