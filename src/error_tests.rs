use super::*;

#[test]
fn signature_table_mapping() {
    let c = classify("AuthApiError: Invalid login credentials");
    assert_eq!(c.code, AuthErrorCode::InvalidCredentials);
    assert_eq!(c.severity, Severity::Medium);
    assert!(!c.should_retry);
    assert!(!c.should_logout);

    let c = classify("Email not confirmed");
    assert_eq!(c.code, AuthErrorCode::EmailNotConfirmed);

    let c = classify("User already registered");
    assert_eq!(c.code, AuthErrorCode::DuplicateAccount);

    let c = classify("fetch failed: connection refused");
    assert_eq!(c.code, AuthErrorCode::NetworkError);
    assert!(c.should_retry);
    assert!(!c.should_logout);
}

#[test]
fn session_errors_force_logout() {
    for raw in ["session_not_found", "JWT expired", "bad_jwt", "refresh_token_not_found"] {
        let c = classify(raw);
        assert!(c.should_logout, "{} should demand logout", raw);
        assert_eq!(c.severity, Severity::High);
    }
}

#[test]
fn expired_token_not_shadowed_by_timeout_signature() {
    // "token is expired" contains no connectivity words, but make sure a
    // combined message still resolves to the session code listed first.
    let c = classify("request failed: token is expired (retry timeout reached)");
    assert_eq!(c.code, AuthErrorCode::SessionExpired);
}

#[test]
fn structured_code_wins_over_substrings() {
    let c = classify("code=rate_limited while loading profile over network");
    assert_eq!(c.code, AuthErrorCode::RateLimited);

    // Exact bare code token.
    let c = classify("profile_creation_failed");
    assert_eq!(c.code, AuthErrorCode::ProfileCreationFailed);
    assert!(!c.should_logout);
}

#[test]
fn unknown_defaults_to_retryable_high() {
    let c = classify("some entirely novel failure");
    assert_eq!(c.code, AuthErrorCode::UnknownAuthError);
    assert_eq!(c.severity, Severity::High);
    assert!(c.should_retry);
    assert!(!c.should_logout);
}

#[test]
fn severity_ordering_is_total() {
    assert!(Severity::Low < Severity::Medium);
    assert!(Severity::Medium < Severity::High);
    assert!(Severity::High < Severity::Critical);
    assert_eq!(
        [Severity::Low, Severity::Critical, Severity::Medium].iter().max(),
        Some(&Severity::Critical)
    );
}

#[test]
fn classify_anyhow_uses_full_chain() {
    let err = anyhow::anyhow!("connection reset").context("profile fetch");
    let c = classify_anyhow(&err);
    assert_eq!(c.code, AuthErrorCode::NetworkError);
}
