//! # vigil-gateway
//!
//! HTTP surface for the vigil notification substrate: a push-token callback
//! endpoint the origin server can invoke to trigger an immediate re-poll of
//! an exchange.
//!
//! The origin is handed a callback URL of the shape
//! `<base>/callbacks/<pushToken>` at exchange-creation time. When the
//! exchange changes, the origin POSTs the event there; the gateway verifies
//! the stateless token, coalesces an uncached poll of the referenced
//! exchange, and responds `204 No Content`. Push is best-effort: a missed or
//! rejected callback costs nothing but freshness, because polling remains
//! authoritative.
//!
//! # Security Model
//!
//! - Tokens are HMAC-bound to an event name and expiry; verification is
//!   constant time.
//! - Verification failures are opaque `400` responses. The response body
//!   never distinguishes expiry from signature mismatch or a malformed
//!   token.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod error;
mod routes;

pub use error::GatewayError;
pub use routes::{PushGateway, CALLBACK_EVENT};
