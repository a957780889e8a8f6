//! Envelope validation: structure, freshness, and signatures.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};

use super::{Envelope, CLIENT_MESSAGE_TYPES, UNSIGNED_TYPES};
use crate::crypto::{canonicalize, identity};
use crate::{AppError, Result};

/// Stateless validator configured from the security section.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_age: Duration,
    skew_tolerance: Duration,
}

impl MessageCodec {
    /// Build a codec.
    ///
    /// `command_timeout_ms` bounds how old a command may be;
    /// `clock_skew_ms` bounds how far in the future its timestamp may lie.
    #[must_use]
    pub fn new(command_timeout_ms: u64, clock_skew_ms: u64) -> Self {
        Self {
            max_age: Duration::milliseconds(command_timeout_ms as i64),
            skew_tolerance: Duration::milliseconds(clock_skew_ms as i64),
        }
    }

    /// Validate everything about an envelope that does not need key
    /// material: required fields, recognised type, timestamp freshness,
    /// and signature presence.
    ///
    /// Returns the parsed timestamp on success.
    ///
    /// # Errors
    ///
    /// `AppError::InvalidMessage` for structural faults,
    /// `AppError::CommandExpired` / `AppError::CommandFromFuture` for stale
    /// or future timestamps, `AppError::MissingSignature` when a signed
    /// type arrives bare.
    pub fn validate(&self, envelope: &Envelope, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if envelope.id.is_empty() {
            return Err(AppError::InvalidMessage("id must not be empty".into()));
        }
        if envelope.kind.is_empty() {
            return Err(AppError::InvalidMessage("type must not be empty".into()));
        }
        if !CLIENT_MESSAGE_TYPES.contains(&envelope.kind.as_str()) {
            return Err(AppError::InvalidMessage(format!(
                "unrecognised type: {}",
                envelope.kind
            )));
        }

        let timestamp = DateTime::parse_from_rfc3339(&envelope.timestamp)
            .map_err(|_| AppError::InvalidMessage("timestamp is not RFC 3339".into()))?
            .with_timezone(&Utc);

        // Boundary values are admitted; one millisecond past either edge is
        // not.
        if now - timestamp > self.max_age {
            return Err(AppError::CommandExpired);
        }
        if timestamp - now > self.skew_tolerance {
            return Err(AppError::CommandFromFuture);
        }

        if envelope.signature.is_none() && !UNSIGNED_TYPES.contains(&envelope.kind.as_str()) {
            return Err(AppError::MissingSignature);
        }

        Ok(timestamp)
    }

    /// Verify the envelope's signature against a PEM public key.
    ///
    /// # Errors
    ///
    /// `AppError::MissingSignature` if the envelope carries none,
    /// `AppError::InvalidSignature` if verification fails.
    pub fn verify_signature(&self, envelope: &Envelope, public_key_pem: &str) -> Result<()> {
        let signature = envelope
            .signature
            .as_deref()
            .ok_or(AppError::MissingSignature)?;
        let payload = signed_payload(envelope);
        if identity::verify(payload.as_bytes(), signature, public_key_pem) {
            Ok(())
        } else {
            Err(AppError::InvalidSignature)
        }
    }
}

/// The canonical byte string a client signs:
/// `{"data":…,"nonce":…,"timestamp":…,"type":…}` in canonical form, with
/// absent `data` standing in as `{}` and absent `nonce` as `null`.
#[must_use]
pub fn signed_payload(envelope: &Envelope) -> String {
    let data = envelope
        .data
        .clone()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    let payload = json!({
        "type": envelope.kind,
        "timestamp": envelope.timestamp,
        "nonce": envelope.nonce,
        "data": data,
    });
    canonicalize(&payload)
}

/// Canonical form of the envelope's `data`, as fed to the replay
/// fingerprint.
#[must_use]
pub fn canonical_data(envelope: &Envelope) -> String {
    let data = envelope
        .data
        .clone()
        .unwrap_or_else(|| Value::Object(serde_json::Map::new()));
    canonicalize(&data)
}
