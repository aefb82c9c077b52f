//! Unified auth failure model and classification helpers.
//! Every raw failure coming back from the identity provider or the profile
//! store is mapped here to a structured classification carrying the severity
//! and the retry/logout policy bits. This table is the single source of truth
//! for those decisions; the reconciler and the validator both consult it.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Severity of a failure or a security finding. Ordering is meaningful:
/// merges take the maximum, never an average.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Closed set of failure codes known to the platform.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthErrorCode {
    InvalidCredentials,
    EmailNotConfirmed,
    SignupDisabled,
    WeakPassword,
    DuplicateAccount,
    SessionNotFound,
    SessionInvalid,
    SessionExpired,
    RefreshUnavailable,
    NetworkError,
    ServerError,
    RateLimited,
    DatabaseError,
    ProfileNotFound,
    ProfileCreationFailed,
    UnknownAuthError,
}

impl AuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthErrorCode::InvalidCredentials => "invalid_credentials",
            AuthErrorCode::EmailNotConfirmed => "email_not_confirmed",
            AuthErrorCode::SignupDisabled => "signup_disabled",
            AuthErrorCode::WeakPassword => "weak_password",
            AuthErrorCode::DuplicateAccount => "duplicate_account",
            AuthErrorCode::SessionNotFound => "session_not_found",
            AuthErrorCode::SessionInvalid => "session_invalid",
            AuthErrorCode::SessionExpired => "session_expired",
            AuthErrorCode::RefreshUnavailable => "refresh_unavailable",
            AuthErrorCode::NetworkError => "network_error",
            AuthErrorCode::ServerError => "server_error",
            AuthErrorCode::RateLimited => "rate_limited",
            AuthErrorCode::DatabaseError => "database_error",
            AuthErrorCode::ProfileNotFound => "profile_not_found",
            AuthErrorCode::ProfileCreationFailed => "profile_creation_failed",
            AuthErrorCode::UnknownAuthError => "unknown_auth_error",
        }
    }
}

/// Structured classification of a raw failure. Produced fresh per failure,
/// never persisted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, thiserror::Error)]
#[error("{}: {}", .code.as_str(), .message)]
pub struct ErrorClassification {
    pub code: AuthErrorCode,
    /// Raw message as received, kept for logs.
    pub message: String,
    /// Fixed, presentable message for the UI.
    pub user_message: &'static str,
    pub severity: Severity,
    pub should_retry: bool,
    pub should_logout: bool,
}

/// Per-code policy: (user_message, severity, should_retry, should_logout).
fn policy_for(code: AuthErrorCode) -> (&'static str, Severity, bool, bool) {
    use AuthErrorCode::*;
    match code {
        InvalidCredentials => ("Incorrect email or password.", Severity::Medium, false, false),
        EmailNotConfirmed => ("Please confirm your email address before signing in.", Severity::Medium, false, false),
        SignupDisabled => ("New registrations are currently disabled.", Severity::Medium, false, false),
        WeakPassword => ("Please choose a stronger password.", Severity::Low, false, false),
        DuplicateAccount => ("An account with this email already exists.", Severity::Medium, false, false),
        SessionNotFound => ("Your session could not be found. Please sign in again.", Severity::High, false, true),
        SessionInvalid => ("Your session is no longer valid. Please sign in again.", Severity::High, false, true),
        SessionExpired => ("Your session has expired. Please sign in again.", Severity::High, false, true),
        RefreshUnavailable => ("Your session could not be refreshed. Please sign in again.", Severity::High, false, true),
        NetworkError => ("Connection problem. Please check your network and try again.", Severity::Medium, true, false),
        ServerError => ("The service is temporarily unavailable. Please try again.", Severity::High, true, false),
        RateLimited => ("Too many attempts. Please wait a moment and try again.", Severity::Medium, true, false),
        DatabaseError => ("A storage error occurred. Please try again.", Severity::High, true, false),
        ProfileNotFound => ("Your profile could not be loaded.", Severity::Medium, true, false),
        ProfileCreationFailed => ("Your account was created but the profile could not be saved.", Severity::High, true, false),
        UnknownAuthError => ("Something went wrong. Please try again.", Severity::High, true, false),
    }
}

/// Substring signature table, matched case-insensitively in order.
/// First hit wins, so the more specific session signatures sit above the
/// generic connectivity ones.
const SIGNATURES: &[(&str, AuthErrorCode)] = &[
    ("invalid login credentials", AuthErrorCode::InvalidCredentials),
    ("invalid_credentials", AuthErrorCode::InvalidCredentials),
    ("wrong password", AuthErrorCode::InvalidCredentials),
    ("email not confirmed", AuthErrorCode::EmailNotConfirmed),
    ("email_not_confirmed", AuthErrorCode::EmailNotConfirmed),
    ("signups not allowed", AuthErrorCode::SignupDisabled),
    ("signup_disabled", AuthErrorCode::SignupDisabled),
    ("password should be", AuthErrorCode::WeakPassword),
    ("weak_password", AuthErrorCode::WeakPassword),
    ("already registered", AuthErrorCode::DuplicateAccount),
    ("already exists", AuthErrorCode::DuplicateAccount),
    ("duplicate", AuthErrorCode::DuplicateAccount),
    ("session_not_found", AuthErrorCode::SessionNotFound),
    ("session not found", AuthErrorCode::SessionNotFound),
    ("refresh_token_not_found", AuthErrorCode::RefreshUnavailable),
    ("no refresh token", AuthErrorCode::RefreshUnavailable),
    ("session expired", AuthErrorCode::SessionExpired),
    ("token is expired", AuthErrorCode::SessionExpired),
    ("jwt expired", AuthErrorCode::SessionExpired),
    ("invalid session", AuthErrorCode::SessionInvalid),
    ("bad_jwt", AuthErrorCode::SessionInvalid),
    ("invalid token", AuthErrorCode::SessionInvalid),
    ("rate limit", AuthErrorCode::RateLimited),
    ("too many requests", AuthErrorCode::RateLimited),
    ("429", AuthErrorCode::RateLimited),
    ("internal server error", AuthErrorCode::ServerError),
    ("502", AuthErrorCode::ServerError),
    ("503", AuthErrorCode::ServerError),
    ("504", AuthErrorCode::ServerError),
    ("profile not found", AuthErrorCode::ProfileNotFound),
    ("0 rows", AuthErrorCode::ProfileNotFound),
    ("profile creation failed", AuthErrorCode::ProfileCreationFailed),
    ("could not create profile", AuthErrorCode::ProfileCreationFailed),
    // Connectivity signatures last: "timeout" alone must not shadow
    // "token is expired" style messages above.
    ("network", AuthErrorCode::NetworkError),
    ("fetch", AuthErrorCode::NetworkError),
    ("connection", AuthErrorCode::NetworkError),
    ("timed out", AuthErrorCode::NetworkError),
    ("timeout", AuthErrorCode::NetworkError),
    ("database", AuthErrorCode::DatabaseError),
    ("pgrst", AuthErrorCode::DatabaseError),
];

impl ErrorClassification {
    /// Build a classification for a known code, keeping the raw message.
    pub fn for_code(code: AuthErrorCode, message: impl Into<String>) -> Self {
        let (user_message, severity, should_retry, should_logout) = policy_for(code);
        ErrorClassification {
            code,
            message: message.into(),
            user_message,
            severity,
            should_retry,
            should_logout,
        }
    }
}

/// Classify a raw failure string. Structured code tokens match first
/// (an exact snake_case code, optionally behind a `code=` marker), then the
/// substring table, then the unknown default.
pub fn classify(raw: &str) -> ErrorClassification {
    let lowered = raw.to_lowercase();

    // Structured code first: either the whole string is a code, or the
    // message carries an explicit `code=<token>` marker.
    let token = lowered
        .split_once("code=")
        .map(|(_, rest)| rest.split([' ', ',', ';']).next().unwrap_or(""))
        .unwrap_or(lowered.trim());
    if let Some(code) = code_from_token(token) {
        return ErrorClassification::for_code(code, raw);
    }

    for (needle, code) in SIGNATURES {
        if lowered.contains(needle) {
            return ErrorClassification::for_code(*code, raw);
        }
    }
    ErrorClassification::for_code(AuthErrorCode::UnknownAuthError, raw)
}

/// Classify an `anyhow::Error` chain by its display form.
pub fn classify_anyhow(err: &anyhow::Error) -> ErrorClassification {
    classify(&format!("{:#}", err))
}

fn code_from_token(token: &str) -> Option<AuthErrorCode> {
    use AuthErrorCode::*;
    let code = match token {
        "invalid_credentials" => InvalidCredentials,
        "email_not_confirmed" => EmailNotConfirmed,
        "signup_disabled" => SignupDisabled,
        "weak_password" => WeakPassword,
        "duplicate_account" => DuplicateAccount,
        "session_not_found" => SessionNotFound,
        "session_invalid" => SessionInvalid,
        "session_expired" => SessionExpired,
        "refresh_unavailable" => RefreshUnavailable,
        "network_error" => NetworkError,
        "server_error" => ServerError,
        "rate_limited" => RateLimited,
        "database_error" => DatabaseError,
        "profile_not_found" => ProfileNotFound,
        "profile_creation_failed" => ProfileCreationFailed,
        _ => return None,
    };
    Some(code)
}

pub type AuthResult<T> = Result<T, ErrorClassification>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
