//! Cryptographic primitives: identity keypair, canonical serialisation,
//! and token generation.

pub mod canonical;
pub mod identity;
pub mod token;

pub use canonical::canonicalize;
pub use identity::BridgeIdentity;
pub use token::{random_token, TokenClaims, TokenSigner};
