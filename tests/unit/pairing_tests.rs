//! Unit tests for the pairing registry.

use prompt_dock::pairing::PairingRegistry;

const CLIENT_PEM: &str = "-----BEGIN PUBLIC KEY-----\nMFo=\n-----END PUBLIC KEY-----\n";

#[test]
fn issued_code_has_the_documented_shape() {
    let registry = PairingRegistry::new();
    let code = registry.issue("App", "https://app.test", "BRIDGE-PEM");

    let groups: Vec<&str> = code.code.split('-').collect();
    assert_eq!(groups.len(), 3, "code {} must have three groups", code.code);
    for group in groups {
        assert_eq!(group.len(), 4);
        assert!(group
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
    }
    assert_eq!(code.bridge_public_key, "BRIDGE-PEM");
    assert!(code.expires_at > code.created_at);
}

#[test]
fn redemption_succeeds_exactly_once() {
    let registry = PairingRegistry::new();
    let code = registry.issue("App", "https://app.test", "BRIDGE-PEM");

    let redemption = registry
        .redeem(&code.code, CLIENT_PEM)
        .expect("first redemption succeeds");
    assert_eq!(redemption.app_name, "App");
    assert_eq!(redemption.app_url, "https://app.test");
    assert_eq!(redemption.client_public_key, CLIENT_PEM);

    assert!(
        registry.redeem(&code.code, CLIENT_PEM).is_none(),
        "second redemption must observe absence"
    );
}

#[test]
fn all_failure_paths_look_identical() {
    let registry = PairingRegistry::new();
    let code = registry.issue("App", "https://app.test", "BRIDGE-PEM");

    // Unknown code, empty key, and already-used code all return None; the
    // caller cannot tell which clause failed.
    assert!(registry.redeem("0000-0000-0000", CLIENT_PEM).is_none());
    assert!(registry.redeem(&code.code, "").is_none());
    assert!(registry.redeem(&code.code, CLIENT_PEM).is_some());
    assert!(registry.redeem(&code.code, CLIENT_PEM).is_none());
}

#[test]
fn codes_are_tracked_until_redeemed() {
    let registry = PairingRegistry::new();
    assert!(registry.is_empty());
    let code = registry.issue("App", "https://app.test", "BRIDGE-PEM");
    assert_eq!(registry.len(), 1);
    registry.redeem(&code.code, CLIENT_PEM);
    assert!(registry.is_empty());
}
