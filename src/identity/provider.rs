//! Contracts for the external collaborators: the identity provider, the
//! canonical profile store, and the activity/audit sink. The reconciler only
//! ever talks to these traits; shells bind them to the real backends.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::principal::Role;
use super::session::ExternalSession;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub full_name: String,
    pub role: Role,
}

/// Canonical profile row as stored in the profile store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileRecord {
    pub id: String,
    pub email: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub role: Role,
    pub verified: bool,
    pub active: bool,
    #[serde(default)]
    pub onboarding_complete: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: uuid::Uuid,
    pub user_id: String,
    pub action: String,
    pub entity_type: String,
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub details: Value,
    pub at: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn now(user_id: impl Into<String>, action: impl Into<String>) -> Self {
        ActivityEntry {
            id: uuid::Uuid::new_v4(),
            user_id: user_id.into(),
            action: action.into(),
            entity_type: "auth".into(),
            entity_id: None,
            details: Value::Null,
            at: Utc::now(),
        }
    }
}

/// External authority issuing and revoking sessions. Credential mechanics
/// (hashing, token issuance) live entirely behind this seam.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(&self, req: &SignUpRequest) -> Result<ExternalSession>;
    async fn sign_in(&self, creds: &Credentials) -> Result<ExternalSession>;
    async fn sign_out(&self) -> Result<()>;
    /// Startup probe: the current session, if the provider holds one.
    async fn get_session(&self) -> Result<Option<ExternalSession>>;
}

/// Keyed lookup over the canonical profile records. May lag the provider
/// (eventual consistency); callers retry.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<Option<ProfileRecord>>;
    async fn upsert(&self, record: &ProfileRecord) -> Result<()>;
    async fn update_fields(&self, user_id: &str, patch: &Value) -> Result<()>;
}

/// Best-effort audit sink. Failures must never block the audited operation.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn record(&self, entry: &ActivityEntry) -> Result<()>;
    /// Entries for the identity within the trailing window.
    async fn count_since(&self, user_id: &str, window: chrono::Duration) -> Result<usize>;
    /// Failed sign-in attempts for the identity within the trailing window.
    async fn failed_logins_since(&self, user_id: &str, window: chrono::Duration) -> Result<usize>;
}
