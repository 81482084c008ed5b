//! Authorization of image requests.
//!
//! A request path has the shape
//! `/{token}/data[-saver]/{chapter-id}/{name}-{content-hash}.{ext}`. The
//! validator runs three stages in order: path pattern, referer policy, and
//! token verification. The token is a URL-safe base64 blob made of a 24 byte
//! nonce followed by an XSalsa20-Poly1305 box sealed with the precomputed key
//! handed out by the control plane.

use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::{Key, Nonce, XSalsa20Poly1305};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::EdgeResult;
use crate::request::EdgeRequest;

/// Length of the precomputed box key.
pub const KEY_SIZE: usize = 32;
/// Length of the nonce prefix carried by every token.
pub const NONCE_SIZE: usize = 24;

static PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^/?([^/]*)(/data(?:-saver)?/[a-zA-Z0-9]{32}/[^/\-]+-([a-zA-Z0-9]{64}\.[a-z]{3,4}))$",
    )
    .expect("path pattern is a valid regex")
});

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("invalid path pattern")]
    PathPattern,
    #[error("referer rejected: {0}")]
    Referer(String),
    #[error("token is not valid base64: {0}")]
    TokenEncoding(#[from] base64::DecodeError),
    #[error("invalid length of token ({0} bytes)")]
    TokenLength(usize),
    #[error("no token key has been configured")]
    MissingKey,
    #[error("decryption of token failed")]
    Decryption,
    #[error("token payload is malformed: {0}")]
    TokenPayload(#[from] serde_json::Error),
    #[error("token expired at {0}")]
    Expired(DateTime<Utc>),
}

#[derive(Debug, Error)]
pub enum KeyUpdateError {
    #[error("token key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token key must decode to {KEY_SIZE} bytes, got {0}")]
    Length(usize),
}

/// Decrypted content of a path token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathToken {
    pub client_id: String,
    pub expires: DateTime<Utc>,
    pub hash: String,
}

/// Result of a successful validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath {
    /// Path without the token, e.g. `/data/{id}/{name}-{hash}.png`; appended to the origin URL.
    pub canonical_path: String,
    /// `{hash}.{ext}`, the cache key.
    pub content_key: String,
}

/// Hook consulted between path and token checks.
pub trait RefererPolicy: Send + Sync {
    fn check(&self, referer: Option<&str>) -> Result<(), ValidationError>;
}

/// Accepts every referer, including none.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAnyReferer;

impl RefererPolicy for AllowAnyReferer {
    fn check(&self, _referer: Option<&str>) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Immutable validator snapshot. Replaced wholesale on every update.
#[derive(Debug, Clone, Default)]
pub struct ValidatorState {
    disabled: bool,
    key_base64: String,
    key: Option<[u8; KEY_SIZE]>,
}

impl ValidatorState {
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn key_base64(&self) -> &str {
        &self.key_base64
    }

    pub fn key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.key.as_ref()
    }
}

pub struct RequestValidator {
    state: RwLock<Arc<ValidatorState>>,
    referer: Arc<dyn RefererPolicy>,
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestValidator {
    /// A validator with token checks enabled and no key yet; every token is rejected until
    /// the control plane pushes a key.
    pub fn new() -> Self {
        Self::with_referer_policy(Arc::new(AllowAnyReferer))
    }

    /// A validator that only checks the path pattern.
    pub fn disabled() -> Self {
        let validator = Self::new();
        validator.swap(ValidatorState {
            disabled: true,
            ..ValidatorState::default()
        });
        validator
    }

    pub fn with_referer_policy(referer: Arc<dyn RefererPolicy>) -> Self {
        Self {
            state: RwLock::new(Arc::new(ValidatorState::default())),
            referer,
        }
    }

    pub fn snapshot(&self) -> Arc<ValidatorState> {
        Arc::clone(&self.state.read())
    }

    fn swap(&self, state: ValidatorState) {
        *self.state.write() = Arc::new(state);
    }

    pub fn is_disabled(&self) -> bool {
        self.snapshot().is_disabled()
    }

    /// Apply the token settings from a heartbeat.
    ///
    /// The disabled flag always takes effect. The key is only re-derived when the base64
    /// string changed, and a key that does not decode to [`KEY_SIZE`] bytes leaves the
    /// previous key bytes in place.
    pub fn update(&self, disabled: bool, key_base64: &str) -> Result<(), KeyUpdateError> {
        let current = self.snapshot();
        if current.key_base64 == key_base64 {
            if current.disabled != disabled {
                self.swap(ValidatorState {
                    disabled,
                    ..(*current).clone()
                });
            }
            return Ok(());
        }

        let decoded = decode_key(key_base64);
        let key = match &decoded {
            Ok(bytes) => Some(*bytes),
            Err(_) => current.key,
        };
        self.swap(ValidatorState {
            disabled,
            key_base64: key_base64.to_string(),
            key,
        });

        match decoded {
            Ok(_) => {
                info!(target: "cheetah::validator", disabled, "token key updated");
                Ok(())
            }
            Err(err) => {
                warn!(target: "cheetah::validator", error = %err, "rejected token key update");
                Err(err)
            }
        }
    }

    /// Verify path, referer and token and return the path with the token stripped.
    pub fn extract_validated_path(
        &self,
        request: &EdgeRequest,
    ) -> Result<ValidatedPath, ValidationError> {
        self.validate_at(request.path(), request.referer(), Utc::now())
    }

    /// Shared authorization step of both handler variants: validates and writes the
    /// accepted/blocked access log line.
    pub fn authorize(&self, request: &EdgeRequest) -> EdgeResult<ValidatedPath> {
        match self.extract_validated_path(request) {
            Ok(validated) => {
                debug!(
                    target: "cheetah::access",
                    peer = %request.peer(),
                    target_path = %request.display_target(),
                    "request accepted"
                );
                Ok(validated)
            }
            Err(err) => {
                debug!(
                    target: "cheetah::access",
                    peer = %request.peer(),
                    target_path = %request.display_target(),
                    reason = %err,
                    "request blocked"
                );
                Err(err.into())
            }
        }
    }

    pub fn validate_at(
        &self,
        path: &str,
        referer: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedPath, ValidationError> {
        let (token, validated) = match_path(path)?;
        self.referer.check(referer)?;
        let state = self.snapshot();
        if !state.disabled {
            open_token(&state, token, now)?;
        }
        Ok(validated)
    }
}

fn match_path(path: &str) -> Result<(&str, ValidatedPath), ValidationError> {
    let captures = PATH_PATTERN
        .captures(path)
        .ok_or(ValidationError::PathPattern)?;
    match (captures.get(1), captures.get(2), captures.get(3)) {
        (Some(token), Some(canonical), Some(key)) => Ok((
            token.as_str(),
            ValidatedPath {
                canonical_path: canonical.as_str().to_string(),
                content_key: key.as_str().to_string(),
            },
        )),
        _ => Err(ValidationError::PathPattern),
    }
}

fn open_token(
    state: &ValidatorState,
    token: &str,
    now: DateTime<Utc>,
) -> Result<PathToken, ValidationError> {
    let raw = URL_SAFE_NO_PAD.decode(token)?;
    if raw.len() < NONCE_SIZE {
        return Err(ValidationError::TokenLength(raw.len()));
    }
    let key = state.key.as_ref().ok_or(ValidationError::MissingKey)?;
    let (nonce, sealed) = raw.split_at(NONCE_SIZE);
    let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| ValidationError::Decryption)?;
    let token: PathToken = serde_json::from_slice(&plaintext)?;
    if token.expires <= now {
        return Err(ValidationError::Expired(token.expires));
    }
    Ok(token)
}

fn decode_key(key_base64: &str) -> Result<[u8; KEY_SIZE], KeyUpdateError> {
    let bytes = STANDARD.decode(key_base64)?;
    <[u8; KEY_SIZE]>::try_from(bytes.as_slice()).map_err(|_| KeyUpdateError::Length(bytes.len()))
}
