//! Shared fixtures for integration tests.

use std::net::TcpListener;
use std::sync::Arc;

use prompt_dock::config::BridgeConfig;
use prompt_dock::crypto::BridgeIdentity;
use prompt_dock::daemon;
use prompt_dock::server::AppState;

/// Origin present in the test allow-list.
pub const GOOD_ORIGIN: &str = "https://x.test";

/// Reserve an ephemeral loopback port.
pub fn reserve_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let port = listener.local_addr().expect("probe addr").port();
    drop(listener);
    port
}

/// Test configuration with `GOOD_ORIGIN` allowed and ephemeral ports.
pub fn test_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.port = reserve_port();
    config.ws_port = Some(reserve_port());
    config.allowed_origins = vec![GOOD_ORIGIN.to_owned()];
    config
}

/// Build a full application state rooted in a fresh temp dir.
///
/// The tempdir guard must stay alive for the duration of the test.
pub fn test_state(config: BridgeConfig) -> (Arc<AppState>, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let state = daemon::build_state(temp.path(), config).expect("build state");
    (state, temp)
}

/// A client-side RSA keypair for signing test envelopes.
///
/// Reuses the identity machinery; the keys live in their own tempdir.
pub fn client_keypair() -> (BridgeIdentity, tempfile::TempDir) {
    let temp = tempfile::tempdir().expect("tempdir");
    let identity = BridgeIdentity::init(temp.path()).expect("client keypair");
    (identity, temp)
}
