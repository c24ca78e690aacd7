//! HMAC-SHA256 tokens proving a data request follows a document render.
//!
//! Token format: `<issued-at unix seconds>.<hex hmac>` where the MAC covers
//! `"<issued-at>:<scope>"`. The scope names the app (or build) that issued the
//! token, so a token from any document of that app is valid for every data
//! request inside the window.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Scope used when none is configured.
pub const DEFAULT_SCOPE: &str = "routeweave";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("missing data signature")]
    Missing,

    #[error("malformed data signature")]
    Malformed,

    #[error("data signature issued at {issued_at} is outside the {window_secs}s window")]
    Expired { issued_at: u64, window_secs: u64 },

    #[error("data signature mismatch")]
    Mismatch,

    #[error("signing key rejected by HMAC")]
    InvalidKey,
}

/// Issues and verifies data-request tokens.
#[derive(Clone)]
pub struct DataSigner {
    key: Vec<u8>,
    scope: String,
    window: Duration,
}

impl std::fmt::Debug for DataSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSigner")
            .field("scope", &self.scope)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl DataSigner {
    pub fn new(secret: impl AsRef<[u8]>, window: Duration) -> Self {
        Self {
            key: secret.as_ref().to_vec(),
            scope: DEFAULT_SCOPE.to_owned(),
            window,
        }
    }

    /// Bind tokens to `scope`, e.g. an app name or build id.
    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// A token issued now.
    pub fn sign(&self) -> Result<String, SignatureError> {
        self.sign_at(unix_now())
    }

    pub fn sign_at(&self, issued_at: u64) -> Result<String, SignatureError> {
        let mac = self.keyed(issued_at)?.finalize().into_bytes();
        Ok(format!("{issued_at}.{}", hex::encode(mac)))
    }

    /// Check `token` against the current time.
    pub fn verify(&self, token: &str) -> Result<(), SignatureError> {
        self.verify_at(token, unix_now())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> Result<(), SignatureError> {
        let (issued_at, mac) = token.split_once('.').ok_or(SignatureError::Malformed)?;
        let issued_at: u64 = issued_at.parse().map_err(|_| SignatureError::Malformed)?;
        let mac = hex::decode(mac).map_err(|_| SignatureError::Malformed)?;

        let window_secs = self.window.as_secs();
        if now.abs_diff(issued_at) > window_secs {
            return Err(SignatureError::Expired {
                issued_at,
                window_secs,
            });
        }

        self.keyed(issued_at)?
            .verify_slice(&mac)
            .map_err(|_| SignatureError::Mismatch)
    }

    // MAC state already fed with the signed message.
    fn keyed(&self, issued_at: u64) -> Result<HmacSha256, SignatureError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).map_err(|_| SignatureError::InvalidKey)?;
        mac.update(format!("{issued_at}:{}", self.scope).as_bytes());
        Ok(mac)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
