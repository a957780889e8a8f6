//! Unit tests for the bridge identity keypair.

use prompt_dock::crypto::identity;
use prompt_dock::crypto::BridgeIdentity;

#[test]
fn init_generates_and_reloads_the_same_key() {
    let temp = tempfile::tempdir().expect("tempdir");

    let first = BridgeIdentity::init(temp.path()).expect("generate");
    let public = first.public_key_pem().to_owned();
    assert!(public.contains("BEGIN PUBLIC KEY"));

    let second = BridgeIdentity::init(temp.path()).expect("reload");
    assert_eq!(second.public_key_pem(), public);

    // A signature from the first instance verifies under the reloaded key.
    let signature = first.sign(b"payload").expect("sign");
    assert!(identity::verify(b"payload", &signature, second.public_key_pem()));
}

#[test]
fn sign_verify_roundtrip_and_tamper_detection() {
    let temp = tempfile::tempdir().expect("tempdir");
    let id = BridgeIdentity::init(temp.path()).expect("generate");

    let signature = id.sign(b"the exact payload").expect("sign");
    assert!(identity::verify(
        b"the exact payload",
        &signature,
        id.public_key_pem()
    ));
    assert!(!identity::verify(
        b"the exact payloae",
        &signature,
        id.public_key_pem()
    ));
    assert!(!identity::verify(
        b"the exact payload",
        "not-base64!!",
        id.public_key_pem()
    ));
    assert!(!identity::verify(
        b"the exact payload",
        &signature,
        "-----BEGIN PUBLIC KEY-----\ngarbage\n-----END PUBLIC KEY-----\n"
    ));
}

#[cfg(unix)]
#[test]
fn key_files_are_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempfile::tempdir().expect("tempdir");
    let _id = BridgeIdentity::init(temp.path()).expect("generate");

    let mode = std::fs::metadata(temp.path().join("keys").join("private.pem"))
        .expect("metadata")
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o600, "private key must be mode 0600");
}

#[cfg(unix)]
#[test]
fn world_readable_private_key_is_fatal() {
    use std::os::unix::fs::PermissionsExt;

    let temp = tempfile::tempdir().expect("tempdir");
    let _id = BridgeIdentity::init(temp.path()).expect("generate");

    let private = temp.path().join("keys").join("private.pem");
    std::fs::set_permissions(&private, std::fs::Permissions::from_mode(0o644))
        .expect("chmod");

    assert!(
        BridgeIdentity::init(temp.path()).is_err(),
        "loading a group/world-readable private key must fail"
    );
}
