use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed role set. `Admin` satisfies every role check; the hierarchy is
/// otherwise flat.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Donor,
    Charity,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Donor => "donor",
            Role::Charity => "charity",
            Role::Admin => "admin",
        }
    }

    /// Parse a role label; anything unknown maps to the least-privileged role.
    pub fn parse(s: &str) -> Role {
        match s.trim().to_lowercase().as_str() {
            "admin" => Role::Admin,
            "charity" => Role::Charity,
            _ => Role::Donor,
        }
    }
}

impl Default for Role {
    fn default() -> Self {
        Role::Donor
    }
}

/// How the resident identity was constructed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Built from a successful canonical profile fetch.
    Canonical,
    /// Synthesized from cache/session metadata after the canonical fetch
    /// failed or timed out. Trust decisions gated on canonical-only fields
    /// must check this flag.
    DegradedFallback,
}

/// The materialized, application-facing user view. Owned exclusively by the
/// reconciler; everything else reads it through accessors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
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
    pub provenance: Provenance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    pub fn has_role(&self, role: Role) -> bool {
        self.role == Role::Admin || self.role == role
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        self.role == Role::Admin || roles.contains(&self.role)
    }

    pub fn is_degraded(&self) -> bool {
        self.provenance == Provenance::DegradedFallback
    }
}
