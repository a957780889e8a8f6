//! Short-lived single-use pairing codes.
//!
//! A pairing code binds one pairing attempt to an app identity and to the
//! bridge public key the app will later verify signatures against. Codes
//! expire five minutes after issuance and admit at most one successful
//! redemption.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::debug;

/// Pairing codes live for five minutes.
pub const CODE_LIFETIME_SECS: i64 = 300;

/// A pending pairing code.
#[derive(Debug, Clone)]
pub struct PairingCode {
    /// Three groups of four uppercase hex characters, hyphen-separated.
    pub code: String,
    /// Requesting application name.
    pub app_name: String,
    /// Requesting application URL.
    pub app_url: String,
    /// Bridge public key (PEM) handed to the app for later verification.
    pub bridge_public_key: String,
    /// Issuance instant.
    pub created_at: DateTime<Utc>,
    /// Expiry instant (`created_at` + five minutes).
    pub expires_at: DateTime<Utc>,
}

/// Data released by a successful redemption.
#[derive(Debug, Clone)]
pub struct RedemptionData {
    /// Application name the code was issued for.
    pub app_name: String,
    /// Application URL the code was issued for.
    pub app_url: String,
    /// Client public key (PEM) presented at redemption.
    pub client_public_key: String,
}

/// Process-wide registry of outstanding pairing codes.
///
/// A single mutex serialises the small map; every operation sweeps expired
/// entries opportunistically.
#[derive(Default)]
pub struct PairingRegistry {
    codes: Mutex<HashMap<String, PairingCode>>,
}

impl PairingRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh code bound to the given app identity.
    pub fn issue(&self, app_name: &str, app_url: &str, bridge_public_key: &str) -> PairingCode {
        let now = Utc::now();
        let entry = PairingCode {
            code: generate_code(),
            app_name: app_name.to_owned(),
            app_url: app_url.to_owned(),
            bridge_public_key: bridge_public_key.to_owned(),
            created_at: now,
            expires_at: now + Duration::seconds(CODE_LIFETIME_SECS),
        };

        let mut codes = self
            .codes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sweep(&mut codes, now);
        codes.insert(entry.code.clone(), entry.clone());
        debug!(app_name, "pairing code issued");
        entry
    }

    /// Redeem a code against a client public key.
    ///
    /// Returns `Some` exactly once per code: the entry is removed in the
    /// same critical section, so a concurrent redemption attempt observes
    /// absence. Every failure path returns `None`; callers must report all
    /// of them uniformly as "invalid or expired code".
    pub fn redeem(&self, code: &str, client_public_key: &str) -> Option<RedemptionData> {
        if client_public_key.trim().is_empty() {
            return None;
        }

        let now = Utc::now();
        let mut codes = self
            .codes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sweep(&mut codes, now);

        let entry = codes.remove(code)?;
        if entry.expires_at < now {
            return None;
        }

        Some(RedemptionData {
            app_name: entry.app_name,
            app_url: entry.app_url,
            client_public_key: client_public_key.to_owned(),
        })
    }

    /// Number of live (unexpired) codes; used by health reporting.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Utc::now();
        let mut codes = self
            .codes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        sweep(&mut codes, now);
        codes.len()
    }

    /// Whether the registry holds no live codes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sweep(codes: &mut HashMap<String, PairingCode>, now: DateTime<Utc>) {
    codes.retain(|_, entry| entry.expires_at >= now);
}

/// Generate a code of the shape `A1B2-C3D4-E5F6`.
fn generate_code() -> String {
    let mut bytes = [0u8; 6];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
    format!("{}-{}-{}", &hex[0..4], &hex[4..8], &hex[8..12])
}
