//! Stateless push tokens for origin-initiated re-polls.
//!
//! A push token binds an event name and an expiry into a compact bearer
//! string the origin server can present back to this process, authenticated
//! by a process-wide HMAC-SHA-256 key. Tokens carry no server-side state:
//! verification recomputes the signature and compares it in constant time.
//!
//! # Wire format
//!
//! ```text
//! "u" || base64url(JSON([event, expires_ms])) || "." || "u" || base64url(hmac)
//! ```
//!
//! The `u` prefix is the multibase marker for base64url. The HMAC is computed
//! over the base64url-encoded payload text, not the raw JSON.
//!
//! # Security Model
//!
//! - The key is loaded once at startup from a multibase-`u` multikey blob and
//!   is immutable for the process lifetime.
//! - Signature comparison is constant time; verification time does not depend
//!   on the position of the first differing byte.
//! - Verification failures are opaque to external callers: expiry, event
//!   mismatch, and signature mismatch all surface as the same
//!   [`InvalidPushToken`] error. The internal cause is retained for logs.
//! - Key configuration errors never echo the observed key bytes.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::ExposeSecret;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::config::PushConfig;

type HmacSha256 = Hmac<Sha256>;

/// Multibase prefix for base64url (no padding).
const MULTIBASE_BASE64URL: char = 'u';

/// Multikey header for an AES-256 secret, the only supported key type.
const MULTIKEY_AES256_HEADER: [u8; 2] = [0xA2, 0x01];

/// Required key length for the supported key type.
const AES256_KEY_LEN: usize = 32;

/// Default token lifetime when the caller does not supply an expiry.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(20 * 60);

/// Clock skew tolerated when checking token expiry.
pub const VERIFY_CLOCK_SKEW: Duration = Duration::from_secs(5 * 60);

/// Internal push-token failure causes.
///
/// External callers of [`PushTokens::verify_push_token`] only ever see the
/// opaque [`InvalidPushToken`] wrapper; these variants exist for logging and
/// for key-loading diagnostics at startup.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The key blob uses an unknown multibase prefix or multikey type.
    #[error("unsupported multikey type for push token key")]
    UnsupportedKeyType,

    /// The key material does not decode, or has the wrong length for its
    /// declared type. The observed bytes are deliberately not included.
    #[error("push token key material is invalid for its declared type")]
    InvalidKeyData,

    /// The token is structurally malformed.
    #[error("malformed push token")]
    Malformed,

    /// The token expired before the tolerated clock skew.
    #[error("push token expired")]
    Expired,

    /// The token was minted for a different event.
    #[error("push token event mismatch")]
    EventMismatch,

    /// The presented signature does not match the recomputed one.
    #[error("push token signature mismatch")]
    SignatureMismatch,
}

/// Opaque verification failure returned to callers of
/// [`PushTokens::verify_push_token`].
///
/// The message never distinguishes expiry from signature mismatch or
/// structural problems; the underlying [`TokenError`] is available through
/// [`InvalidPushToken::cause`] and the standard error source chain for
/// internal logging only.
#[derive(Debug, Error)]
#[error("invalid push token")]
pub struct InvalidPushToken {
    #[source]
    cause: TokenError,
}

impl InvalidPushToken {
    /// Returns the internal cause, for logging.
    #[must_use]
    pub const fn cause(&self) -> &TokenError {
        &self.cause
    }
}

impl From<TokenError> for InvalidPushToken {
    fn from(cause: TokenError) -> Self {
        Self { cause }
    }
}

/// A freshly minted push token.
#[derive(Debug, Clone)]
pub struct MintedToken {
    /// The full bearer token, ready to embed in a callback URL.
    pub token: String,

    /// The multibase-`u` signature half of the token.
    pub signature: String,
}

/// The claims recovered from a successfully verified push token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    /// The event the token was minted for.
    pub event: String,

    /// The token expiry.
    pub expires: DateTime<Utc>,
}

/// Process-wide push-token issuer and verifier.
///
/// Constructed once at startup from configuration and shared for the process
/// lifetime. The HMAC state is precomputed at construction; minting never
/// touches the raw key material again.
pub struct PushTokens {
    key_id: String,
    mac: HmacSha256,
}

impl std::fmt::Debug for PushTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushTokens")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl PushTokens {
    /// Creates an issuer from a key identifier and a multibase-`u` multikey
    /// secret.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::UnsupportedKeyType`] for an unknown multibase
    /// prefix or multikey header, and [`TokenError::InvalidKeyData`] when the
    /// material does not decode or has the wrong length.
    pub fn new(key_id: impl Into<String>, secret_key_multibase: &str) -> Result<Self, TokenError> {
        let key = decode_multikey(secret_key_multibase)?;
        let mac = HmacSha256::new_from_slice(key.as_slice())
            .map_err(|_| TokenError::InvalidKeyData)?;

        Ok(Self {
            key_id: key_id.into(),
            mac,
        })
    }

    /// Creates an issuer from push configuration.
    ///
    /// Returns `Ok(None)` when no HMAC key is configured; push-token
    /// operations are unavailable in that mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured key material is invalid.
    pub fn from_config(config: &PushConfig) -> Result<Option<Self>, TokenError> {
        match &config.hmac_key {
            None => {
                tracing::info!("push notification is disabled");
                Ok(None)
            },
            Some(key) => Ok(Some(Self::new(
                key.id.clone(),
                key.secret_key_multibase.expose_secret(),
            )?)),
        }
    }

    /// Returns the opaque key identifier.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Mints a push token for `event`.
    ///
    /// `expires` defaults to now plus [`DEFAULT_TOKEN_TTL`] when omitted.
    #[must_use]
    pub fn create_push_token(&self, event: &str, expires: Option<DateTime<Utc>>) -> MintedToken {
        let expires = expires.unwrap_or_else(|| {
            Utc::now() + chrono::Duration::from_std(DEFAULT_TOKEN_TTL).unwrap_or_default()
        });

        let payload = encode_payload(event, expires);
        let signature = format!(
            "{MULTIBASE_BASE64URL}{}",
            URL_SAFE_NO_PAD.encode(self.sign(payload.as_bytes()))
        );

        MintedToken {
            token: format!("{MULTIBASE_BASE64URL}{payload}.{signature}"),
            signature,
        }
    }

    /// Verifies a push token and recovers its claims.
    ///
    /// When `expected_event` is supplied, the token must have been minted for
    /// that exact event.
    ///
    /// # Errors
    ///
    /// Returns the opaque [`InvalidPushToken`] for any failure: structural
    /// problems, expiry beyond [`VERIFY_CLOCK_SKEW`], event mismatch, or
    /// signature mismatch.
    pub fn verify_push_token(
        &self,
        token: &str,
        expected_event: Option<&str>,
    ) -> Result<VerifiedToken, InvalidPushToken> {
        Ok(self.verify_inner(token, expected_event)?)
    }

    fn verify_inner(
        &self,
        token: &str,
        expected_event: Option<&str>,
    ) -> Result<VerifiedToken, TokenError> {
        let (payload_half, signature_half) =
            token.split_once('.').ok_or(TokenError::Malformed)?;

        let payload = payload_half
            .strip_prefix(MULTIBASE_BASE64URL)
            .ok_or(TokenError::Malformed)?;
        let signature = signature_half
            .strip_prefix(MULTIBASE_BASE64URL)
            .ok_or(TokenError::Malformed)?;

        let (event, expires) = decode_payload(payload)?;

        let skew = chrono::Duration::from_std(VERIFY_CLOCK_SKEW).unwrap_or_default();
        if expires < Utc::now() - skew {
            return Err(TokenError::Expired);
        }

        if let Some(expected) = expected_event {
            if event != expected {
                return Err(TokenError::EventMismatch);
            }
        }

        let presented = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| TokenError::Malformed)?;
        let computed = self.sign(payload.as_bytes());

        // ct_eq yields an all-zero choice for length mismatches as well, so
        // the comparison cost is independent of where the bytes differ.
        if !bool::from(computed.as_slice().ct_eq(presented.as_slice())) {
            return Err(TokenError::SignatureMismatch);
        }

        Ok(VerifiedToken { event, expires })
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = self.mac.clone();
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

fn encode_payload(event: &str, expires: DateTime<Utc>) -> String {
    // Serializing a (&str, i64) tuple cannot fail.
    let json = serde_json::to_string(&(event, expires.timestamp_millis()))
        .unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

fn decode_payload(payload: &str) -> Result<(String, DateTime<Utc>), TokenError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    let (event, expires_ms): (String, i64) =
        serde_json::from_slice(&bytes).map_err(|_| TokenError::Malformed)?;
    let expires = DateTime::from_timestamp_millis(expires_ms).ok_or(TokenError::Malformed)?;
    Ok((event, expires))
}

/// Decodes a multibase-`u` multikey blob into raw AES-256 key bytes.
fn decode_multikey(secret_key_multibase: &str) -> Result<Zeroizing<[u8; AES256_KEY_LEN]>, TokenError> {
    let encoded = secret_key_multibase
        .strip_prefix(MULTIBASE_BASE64URL)
        .ok_or(TokenError::UnsupportedKeyType)?;

    let bytes = Zeroizing::new(
        URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| TokenError::InvalidKeyData)?,
    );

    if bytes.len() < MULTIKEY_AES256_HEADER.len() {
        return Err(TokenError::InvalidKeyData);
    }
    if bytes[..2] != MULTIKEY_AES256_HEADER {
        return Err(TokenError::UnsupportedKeyType);
    }
    if bytes.len() != MULTIKEY_AES256_HEADER.len() + AES256_KEY_LEN {
        return Err(TokenError::InvalidKeyData);
    }

    let mut key = Zeroizing::new([0u8; AES256_KEY_LEN]);
    key.copy_from_slice(&bytes[2..]);
    Ok(key)
}
