use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Bare identity reference as issued by the provider, before any profile
/// reconciliation. `user_metadata` and `app_metadata` are opaque provider
/// blobs; the profile loader mines them for fallback seed material.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentityRef {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub email_confirmed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user_metadata: Value,
    #[serde(default)]
    pub app_metadata: Value,
}

/// Read-only copy of the provider-issued session. Replaced wholesale on
/// every provider event, never mutated field-by-field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalSession {
    pub user: IdentityRef,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub provider_meta: Value,
}

impl ExternalSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Event kinds emitted by the provider's subscription.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthEvent {
    /// Duplicate of the startup probe; initialization owns it.
    Bootstrap,
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    PasswordRecovery,
}

/// One element of the provider event stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    pub event: AuthEvent,
    pub session: Option<ExternalSession>,
}

impl AuthChange {
    pub fn new(event: AuthEvent, session: Option<ExternalSession>) -> Self {
        AuthChange { event, session }
    }
}

/// Session metadata the security validator inspects. Assembled by the shell
/// from whatever client signals it has; every field is best-effort.
#[derive(Debug, Clone, Default)]
pub struct SessionMeta {
    pub issued_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub user_agent: Option<String>,
}
