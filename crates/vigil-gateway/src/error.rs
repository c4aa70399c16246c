//! Error-to-status mapping for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use vigil_core::poll::PollError;
use vigil_core::store::StoreError;
use vigil_core::token::InvalidPushToken;
use vigil_core::watch::WatchError;

/// Errors a gateway request can surface.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Push-token verification failed, for any reason.
    #[error(transparent)]
    Token(#[from] InvalidPushToken),

    /// The callback body is not the expected event shape.
    #[error("invalid callback body: {0}")]
    Payload(String),

    /// The poll path failed.
    #[error(transparent)]
    Poll(#[from] PollError),

    /// The watch path failed.
    #[error(transparent)]
    Watch(#[from] WatchError),

    /// The watch store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Token(_) | Self::Payload(_) => StatusCode::BAD_REQUEST,
            Self::Poll(poll) => match poll {
                PollError::QuotaExceeded => StatusCode::SERVICE_UNAVAILABLE,
                PollError::Aborted { .. } | PollError::Operation { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                },
            },
            Self::Watch(watch) => match watch {
                WatchError::TtlTooLong { .. } => StatusCode::BAD_REQUEST,
                WatchError::Store(store) => store_status(store),
                WatchError::Operation { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Store(store) => store_status(store),
        }
    }
}

fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::Duplicate { .. } | StoreError::InvalidState { .. } => StatusCode::CONFLICT,
        StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::Backend { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Bodies are generic on purpose: verification failures stay opaque
        // and internal failures leak nothing about the backend.
        let status = self.status_code();
        let body = match &self {
            Self::Token(_) => "Invalid push token",
            Self::Payload(_) => "Invalid callback body",
            Self::Poll(PollError::QuotaExceeded) => "Too many concurrent polls",
            Self::Store(StoreError::NotFound { .. })
            | Self::Watch(WatchError::Store(StoreError::NotFound { .. })) => "Not found",
            Self::Store(StoreError::Duplicate { .. } | StoreError::InvalidState { .. })
            | Self::Watch(WatchError::Store(
                StoreError::Duplicate { .. } | StoreError::InvalidState { .. },
            )) => "Conflict",
            Self::Watch(WatchError::TtlTooLong { .. }) => "Watch lifetime too long",
            _ => "Internal server error",
        };

        (status, body).into_response()
    }
}
