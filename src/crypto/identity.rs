//! Bridge identity: a persistent RSA-2048 keypair.
//!
//! The keypair is generated on first start, written under
//! `<state-dir>/keys/` with owner-only permissions, and re-used across
//! restarts. It never rotates automatically.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::{AppError, Result};

const KEY_BITS: usize = 2048;

/// The daemon's signing identity.
pub struct BridgeIdentity {
    private: RsaPrivateKey,
    public_pem: String,
}

impl BridgeIdentity {
    /// Load the keypair from `<state_dir>/keys/`, generating it on first
    /// start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` on generation or parse failure, and fails
    /// fatally (same variant) if the private key file exists but is
    /// readable by group or world.
    pub fn init(state_dir: &Path) -> Result<Self> {
        let private_path = state_dir.join("keys").join("private.pem");
        let public_path = state_dir.join("keys").join("public.pem");

        if private_path.exists() {
            check_owner_only(&private_path)?;
            let pem = fs::read_to_string(&private_path)?;
            let private = RsaPrivateKey::from_pkcs8_pem(&pem)
                .map_err(|err| AppError::Crypto(format!("unreadable private key: {err}")))?;
            let public_pem = fs::read_to_string(&public_path)?;
            return Ok(Self {
                private,
                public_pem,
            });
        }

        info!("no bridge identity found, generating RSA-{KEY_BITS} keypair");
        let mut rng = rand::rngs::OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|err| AppError::Crypto(format!("keypair generation failed: {err}")))?;
        let public_pem = RsaPublicKey::from(&private)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|err| AppError::Crypto(format!("public key encode failed: {err}")))?;
        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|err| AppError::Crypto(format!("private key encode failed: {err}")))?;

        write_owner_only(&private_path, private_pem.as_bytes())?;
        write_owner_only(&public_path, public_pem.as_bytes())?;

        Ok(Self {
            private,
            public_pem,
        })
    }

    /// PEM-encoded public key served during pairing.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_pem
    }

    /// Sign a payload: RSA PKCS#1 v1.5 over SHA-256, base64 standard.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Crypto` if the RSA operation fails.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let digest = Sha256::digest(payload);
        let signature = self
            .private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(|err| AppError::Crypto(format!("sign failed: {err}")))?;
        Ok(BASE64.encode(signature))
    }
}

/// Verify an RSA PKCS#1 v1.5 / SHA-256 signature against a PEM public key.
///
/// Lenient on purpose: any malformed input yields `false`. The signature
/// bytes are never logged.
#[must_use]
pub fn verify(payload: &[u8], signature_b64: &str, public_key_pem: &str) -> bool {
    let Some(public) = parse_public_key_pem(public_key_pem) else {
        return false;
    };
    let Ok(signature) = BASE64.decode(signature_b64) else {
        return false;
    };
    let digest = Sha256::digest(payload);
    public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature)
        .is_ok()
}

/// Parse a PEM public key, accepting both SPKI and PKCS#1 encodings.
#[must_use]
pub fn parse_public_key_pem(pem: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .ok()
        .or_else(|| RsaPublicKey::from_pkcs1_pem(pem).ok())
}

fn write_owner_only(path: &PathBuf, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(unix)]
fn check_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(AppError::Crypto(format!(
            "private key {} is readable by group or world (mode {:o}); refusing to start",
            path.display(),
            mode & 0o777
        )));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
