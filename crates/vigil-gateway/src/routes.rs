//! Axum router and handler for push-token callbacks.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use vigil_core::poll::{PollCoalescer, Poller};
use vigil_core::token::PushTokens;

use crate::error::GatewayError;

/// The event name exchange-update callbacks are minted for.
pub const CALLBACK_EVENT: &str = "exchangeUpdated";

/// Maximum callback body size in bytes.
///
/// Callback events carry a single exchange id; 64KB is ample headroom while
/// bounding what an unauthenticated caller can make the gateway buffer.
const MAX_BODY_SIZE: usize = 64 * 1024;

/// Shared state for the callback handler.
struct CallbackState {
    /// Token verifier.
    tokens: Arc<PushTokens>,

    /// The process-wide poll coalescer.
    coalescer: Arc<PollCoalescer>,

    /// Poller invoked for the exchange named by the callback.
    poller: Arc<dyn Poller>,

    /// Event name tokens must have been minted for.
    expected_event: String,
}

/// The push-token gateway wraps verification state and provides an axum
/// router.
pub struct PushGateway {
    state: Arc<CallbackState>,
}

impl PushGateway {
    /// Creates a gateway that accepts tokens minted for
    /// [`CALLBACK_EVENT`].
    #[must_use]
    pub fn new(
        tokens: Arc<PushTokens>,
        coalescer: Arc<PollCoalescer>,
        poller: Arc<dyn Poller>,
    ) -> Self {
        Self::with_expected_event(tokens, coalescer, poller, CALLBACK_EVENT)
    }

    /// Creates a gateway for a custom event name.
    #[must_use]
    pub fn with_expected_event(
        tokens: Arc<PushTokens>,
        coalescer: Arc<PollCoalescer>,
        poller: Arc<dyn Poller>,
        expected_event: impl Into<String>,
    ) -> Self {
        Self {
            state: Arc::new(CallbackState {
                tokens,
                coalescer,
                poller,
                expected_event: expected_event.into(),
            }),
        }
    }

    /// Returns an axum router for the callback endpoint.
    ///
    /// The router handles `POST /callbacks/:push_token` and responds
    /// `204 No Content` once the re-poll has completed.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/callbacks/:push_token", post(callback_handler))
            .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
            .with_state(Arc::clone(&self.state))
    }
}

/// The callback event body posted by the origin.
#[derive(Debug, Deserialize)]
struct CallbackBody {
    event: CallbackEvent,
}

#[derive(Debug, Deserialize)]
struct CallbackEvent {
    data: CallbackData,
}

#[derive(Debug, Deserialize)]
struct CallbackData {
    #[serde(rename = "exchangeId")]
    exchange_id: String,
}

/// The axum handler for push callbacks.
///
/// This handler:
/// 1. Verifies the push token from the path against the expected event
/// 2. Parses the event body for the exchange id
/// 3. Polls the exchange uncached, coalescing with any concurrent fetch
/// 4. Responds `204 No Content`
async fn callback_handler(
    State(state): State<Arc<CallbackState>>,
    Path(push_token): Path<String>,
    body: Bytes,
) -> Result<StatusCode, GatewayError> {
    tracing::debug!(body_size = body.len(), "push callback received");

    let verified = state
        .tokens
        .verify_push_token(&push_token, Some(&state.expected_event))
        .map_err(|error| {
            tracing::info!(error = %error, cause = ?error.cause(), "push token rejected");
            error
        })?;

    let body: CallbackBody =
        serde_json::from_slice(&body).map_err(|error| GatewayError::Payload(error.to_string()))?;
    let exchange_id = body.event.data.exchange_id;

    tracing::info!(
        event = %verified.event,
        exchange_id = %exchange_id,
        "push callback verified; re-polling"
    );

    state
        .coalescer
        .poll(&exchange_id, Arc::clone(&state.poller), false)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use serde_json::{json, Value};
    use vigil_core::poll::{Observation, PollCoalescerConfig, PollError, PollResult};

    use super::*;

    fn test_tokens() -> Arc<PushTokens> {
        let mut bytes = vec![0xA2, 0x01];
        bytes.extend_from_slice(&[7u8; 32]);
        let multibase = format!("u{}", URL_SAFE_NO_PAD.encode(bytes));
        Arc::new(PushTokens::new("urn:example:key:1", &multibase).unwrap())
    }

    struct CountingPoller {
        calls: AtomicUsize,
        observation: Observation,
    }

    impl CountingPoller {
        fn new(value: Value, mutable: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                observation: Observation { value, mutable },
            })
        }
    }

    #[async_trait]
    impl Poller for CountingPoller {
        async fn poll(
            &self,
            _id: &str,
            _current: Option<&PollResult>,
        ) -> Result<Observation, PollError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.observation.clone())
        }
    }

    fn gateway_state(
        tokens: Arc<PushTokens>,
        poller: Arc<CountingPoller>,
        max_in_flight: usize,
    ) -> Arc<CallbackState> {
        Arc::new(CallbackState {
            tokens,
            coalescer: Arc::new(PollCoalescer::new(PollCoalescerConfig {
                max_in_flight,
                ..Default::default()
            })),
            poller,
            expected_event: CALLBACK_EVENT.to_string(),
        })
    }

    fn callback_body(exchange_id: &str) -> Bytes {
        Bytes::from(
            json!({"event": {"data": {"exchangeId": exchange_id}}}).to_string(),
        )
    }

    async fn call_handler(
        state: Arc<CallbackState>,
        token: String,
        body: Bytes,
    ) -> Result<StatusCode, GatewayError> {
        callback_handler(State(state), Path(token), body).await
    }

    #[tokio::test]
    async fn test_valid_callback_repolls_and_responds_204() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let state = gateway_state(Arc::clone(&tokens), Arc::clone(&poller), 10);

        let minted = tokens.create_push_token(CALLBACK_EVENT, None);
        let status = call_handler(state, minted.token, callback_body("E1"))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(poller.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_bypasses_result_cache() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let state = gateway_state(Arc::clone(&tokens), Arc::clone(&poller), 10);

        for _ in 0..2 {
            let minted = tokens.create_push_token(CALLBACK_EVENT, None);
            call_handler(Arc::clone(&state), minted.token, callback_body("E1"))
                .await
                .unwrap();
        }

        // Each callback polls afresh; a cached mutable result does not
        // suppress the fetch.
        assert_eq!(poller.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tampered_token_rejected_opaquely() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let state = gateway_state(Arc::clone(&tokens), Arc::clone(&poller), 10);

        let minted = tokens.create_push_token(CALLBACK_EVENT, None);
        let mut tampered = minted.token.clone();
        let flipped = if tampered.ends_with('A') { 'B' } else { 'A' };
        tampered.pop();
        tampered.push(flipped);

        let error = call_handler(state, tampered, callback_body("E1"))
            .await
            .unwrap_err();

        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.to_string(), "invalid push token");
        assert_eq!(poller.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_token_for_other_event_rejected() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let state = gateway_state(Arc::clone(&tokens), Arc::clone(&poller), 10);

        let minted = tokens.create_push_token("someOtherEvent", None);
        let error = call_handler(state, minted.token, callback_body("E1"))
            .await
            .unwrap_err();

        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert!(matches!(error, GatewayError::Token(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_rejected() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let state = gateway_state(Arc::clone(&tokens), Arc::clone(&poller), 10);

        let minted = tokens.create_push_token(CALLBACK_EVENT, None);
        let error = call_handler(state, minted.token, Bytes::from_static(b"{}"))
            .await
            .unwrap_err();

        assert!(matches!(error, GatewayError::Payload(_)));
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_saturated_coalescer_maps_to_503() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let state = gateway_state(Arc::clone(&tokens), Arc::clone(&poller), 0);

        let minted = tokens.create_push_token(CALLBACK_EVENT, None);
        let error = call_handler(state, minted.token, callback_body("E1"))
            .await
            .unwrap_err();

        assert_eq!(error.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_router_creation() {
        let tokens = test_tokens();
        let poller = CountingPoller::new(json!({"state": "pending"}), true);
        let gateway = PushGateway::new(
            tokens,
            Arc::new(PollCoalescer::new(PollCoalescerConfig::default())),
            poller,
        );
        let _router = gateway.router();
    }
}
