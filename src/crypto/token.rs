//! Random tokens and HMAC-signed session bearer tokens.
//!
//! Bearer tokens are signed with a per-process 64-byte secret generated at
//! startup and never persisted. A process restart therefore invalidates
//! every outstanding token, which is the intended behaviour.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

const SECRET_BYTES: usize = 64;

/// Bearer tokens are valid for one hour from issuance.
pub const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Generate `n` cryptographic-quality random bytes, base64url-encoded
/// without padding.
#[must_use]
pub fn random_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Claims carried inside a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    /// Owning session identifier.
    pub session_id: String,
    /// Paired application name.
    pub app_name: String,
    /// Paired application URL.
    pub app_url: String,
    /// Expiry instant (issuance + one hour).
    pub exp: DateTime<Utc>,
}

/// Issues and validates HMAC-SHA256 bearer tokens.
pub struct TokenSigner {
    secret: [u8; SECRET_BYTES],
}

impl TokenSigner {
    /// Create a signer with a fresh per-process secret.
    #[must_use]
    pub fn new() -> Self {
        let mut secret = [0u8; SECRET_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        Self { secret }
    }

    /// Issue a token for the given session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if claim serialisation fails.
    pub fn issue(&self, session_id: &str, app_name: &str, app_url: &str) -> Result<String> {
        let claims = TokenClaims {
            session_id: session_id.to_owned(),
            app_name: app_name.to_owned(),
            app_url: app_url.to_owned(),
            exp: Utc::now() + Duration::seconds(TOKEN_LIFETIME_SECS),
        };
        let body = serde_json::to_vec(&claims)
            .map_err(|err| AppError::Crypto(format!("claims encode failed: {err}")))?;
        let tag = self.mac(&body);
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&body),
            URL_SAFE_NO_PAD.encode(tag)
        ))
    }

    /// Validate a token's MAC and expiry, returning its claims.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionExpired` for expired tokens and
    /// `AppError::InvalidSignature` for everything else that fails to
    /// validate; the distinction lets callers report expiry precisely
    /// without leaking why a forged token was refused.
    pub fn decode(&self, token: &str) -> Result<TokenClaims> {
        let (body_b64, tag_b64) = token
            .split_once('.')
            .ok_or(AppError::InvalidSignature)?;
        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| AppError::InvalidSignature)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| AppError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|err| AppError::Crypto(format!("hmac init failed: {err}")))?;
        mac.update(&body);
        mac.verify_slice(&tag)
            .map_err(|_| AppError::InvalidSignature)?;

        let claims: TokenClaims =
            serde_json::from_slice(&body).map_err(|_| AppError::InvalidSignature)?;
        if claims.exp < Utc::now() {
            return Err(AppError::SessionExpired);
        }
        Ok(claims)
    }

    fn mac(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}

impl Default for TokenSigner {
    fn default() -> Self {
        Self::new()
    }
}
