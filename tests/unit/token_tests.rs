//! Unit tests for random tokens and the HMAC bearer-token signer.

use prompt_dock::crypto::{random_token, TokenSigner};
use prompt_dock::AppError;

#[test]
fn random_tokens_are_urlsafe_and_unique() {
    let a = random_token(32);
    let b = random_token(32);
    assert_ne!(a, b);
    assert!(!a.contains('='), "no padding");
    assert!(a
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
}

#[test]
fn issue_then_decode_returns_the_claims() {
    let signer = TokenSigner::new();
    let token = signer
        .issue("sess-1", "App", "https://app.test")
        .expect("issue");
    let claims = signer.decode(&token).expect("decode");
    assert_eq!(claims.session_id, "sess-1");
    assert_eq!(claims.app_name, "App");
    assert_eq!(claims.app_url, "https://app.test");
}

#[test]
fn tampered_token_is_rejected() {
    let signer = TokenSigner::new();
    let token = signer
        .issue("sess-1", "App", "https://app.test")
        .expect("issue");

    let mut tampered = token.clone();
    tampered.replace_range(0..1, if token.starts_with('A') { "B" } else { "A" });
    assert!(matches!(
        signer.decode(&tampered),
        Err(AppError::InvalidSignature)
    ));
}

#[test]
fn token_from_another_process_secret_is_rejected() {
    let signer_a = TokenSigner::new();
    let signer_b = TokenSigner::new();
    let token = signer_a
        .issue("sess-1", "App", "https://app.test")
        .expect("issue");
    assert!(matches!(
        signer_b.decode(&token),
        Err(AppError::InvalidSignature)
    ));
}

#[test]
fn token_without_separator_is_rejected() {
    let signer = TokenSigner::new();
    assert!(signer.decode("no-separator-here").is_err());
}
