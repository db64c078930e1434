//! Orderly WebSocket Authentication
//!
//! Private Orderly streams require an `auth` frame on every new connection
//! before any subscription is accepted.
//!
//! # Authentication Flow
//!
//! 1. Connect to `<private endpoint><account id>`
//! 2. Send `{"id":..,"event":"auth","params":{"orderly_key":"ed25519:<key>","sign":..,"timestamp":..}}`
//! 3. Receive `{"event":"auth","success":true}` or a rejection
//!
//! `sign` is the base64 Ed25519 signature of the UTF-8 decimal millisecond
//! timestamp. The signing key is the first 32 bytes of the base58-decoded
//! Orderly secret.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{SECRET_KEY_LENGTH, SigningKey, VerifyingKey};
use thiserror::Error;

use crate::domain::frame::{AuthParams, OutboundFrame};

/// Prefix Orderly expects on the public key identifier.
pub const KEY_PREFIX: &str = "ed25519:";

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while building credentials. Never raised at call time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// A required value was empty.
    #[error("{0} must not be empty")]
    EmptyValue(&'static str),

    /// The secret is not valid base58.
    #[error("orderly secret is not valid base58: {0}")]
    InvalidSecret(String),

    /// The decoded secret is too short to hold a signing key.
    #[error("orderly secret decodes to {len} bytes, need at least {SECRET_KEY_LENGTH}")]
    SecretTooShort {
        /// Decoded length.
        len: usize,
    },
}

// =============================================================================
// Signer
// =============================================================================

/// Produces deterministic signatures over byte payloads.
///
/// Implementations hold no mutable state and are safe to call from any
/// thread.
pub trait Signer: Send + Sync {
    /// Sign `payload`.
    fn sign(&self, payload: &[u8]) -> Vec<u8>;
}

/// Ed25519 signer built from Orderly secret material.
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    /// Build a signer from a base58 secret, using its first 32 decoded bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is empty, not base58, or too short.
    pub fn from_base58_secret(secret: &str) -> Result<Self, AuthError> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Err(AuthError::EmptyValue("orderly secret"));
        }
        let decoded = bs58::decode(secret)
            .into_vec()
            .map_err(|e| AuthError::InvalidSecret(e.to_string()))?;
        let bytes: [u8; SECRET_KEY_LENGTH] = decoded
            .get(..SECRET_KEY_LENGTH)
            .and_then(|head| head.try_into().ok())
            .ok_or(AuthError::SecretTooShort { len: decoded.len() })?;
        Ok(Self::from_bytes(&bytes))
    }

    /// Build a signer from raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    /// Get the matching public key.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        use ed25519_dalek::Signer as _;
        self.key.sign(payload).to_bytes().to_vec()
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

// =============================================================================
// Credential
// =============================================================================

/// Account identity and signing key for a private connection.
///
/// Immutable after construction and cheap to clone.
#[derive(Clone)]
pub struct Credential {
    account_id: String,
    orderly_key: String,
    signer: Arc<dyn Signer>,
}

impl Credential {
    /// Build a credential from an Orderly key and base58 secret.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is empty or the secret is malformed.
    pub fn new(
        account_id: impl Into<String>,
        orderly_key: impl Into<String>,
        orderly_secret: &str,
    ) -> Result<Self, AuthError> {
        let signer = Ed25519Signer::from_base58_secret(orderly_secret)?;
        Self::with_signer(account_id, orderly_key, Arc::new(signer))
    }

    /// Build a credential around an existing signer.
    ///
    /// # Errors
    ///
    /// Returns an error if the account id or key is empty.
    pub fn with_signer(
        account_id: impl Into<String>,
        orderly_key: impl Into<String>,
        signer: Arc<dyn Signer>,
    ) -> Result<Self, AuthError> {
        let account_id = account_id.into();
        let orderly_key = orderly_key.into();
        if account_id.trim().is_empty() {
            return Err(AuthError::EmptyValue("account id"));
        }
        let key = orderly_key.trim().trim_start_matches(KEY_PREFIX);
        if key.is_empty() {
            return Err(AuthError::EmptyValue("orderly key"));
        }
        Ok(Self {
            account_id,
            orderly_key: key.to_owned(),
            signer,
        })
    }

    /// Get the account id.
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Get the public key identifier, without the `ed25519:` prefix.
    #[must_use]
    pub fn orderly_key(&self) -> &str {
        &self.orderly_key
    }

    /// Base64 signature of the decimal timestamp.
    #[must_use]
    pub fn sign_timestamp(&self, timestamp_ms: i64) -> String {
        STANDARD.encode(self.signer.sign(timestamp_ms.to_string().as_bytes()))
    }

    /// Build the auth frame for `timestamp_ms`.
    #[must_use]
    pub fn auth_frame(&self, id: impl Into<String>, timestamp_ms: i64) -> OutboundFrame {
        OutboundFrame::Auth {
            id: id.into(),
            params: AuthParams {
                orderly_key: format!("{KEY_PREFIX}{}", self.orderly_key),
                sign: self.sign_timestamp(timestamp_ms),
                timestamp: timestamp_ms.to_string(),
            },
        }
    }

    /// Build the auth frame for the current wall-clock time.
    #[must_use]
    pub fn auth_frame_now(&self, id: impl Into<String>) -> OutboundFrame {
        self.auth_frame(id, chrono::Utc::now().timestamp_millis())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("account_id", &self.account_id)
            .field("orderly_key", &self.orderly_key)
            .field("signer", &"[REDACTED]")
            .finish()
    }
}
