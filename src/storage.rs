//! Local persisted session artifacts: the enumerable key-value store the
//! shells provide, the cached profile snapshot used as degraded-fallback
//! seed, the scoped sanitizer, and the contamination detector.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::identity::Role;

/// Key holding the JSON-encoded [`CachedProfileSnapshot`].
pub const PROFILE_SNAPSHOT_KEY: &str = "donorlink.cache.profile_snapshot";
/// Key holding the id of the last identity that completed reconciliation.
pub const LAST_USER_KEY: &str = "donorlink.auth.last_user";

/// Auth-related key prefixes/infixes swept by the sanitizer.
const AUTH_KEY_PREFIXES: &[&str] = &["sb-", "donorlink.auth."];
const AUTH_KEY_INFIXES: &[&str] = &["supabase.auth"];

/// Application cache keys cleared alongside the auth keys.
const APP_CACHE_KEYS: &[&str] = &[
    PROFILE_SNAPSHOT_KEY,
    "donorlink.cache.donation_draft",
    "donorlink.cache.campaign_filters",
];

/// Key-value store surviving process restarts. Enumerable so the sanitizer
/// can pattern-match and bulk-delete.
pub trait LocalStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

/// In-memory store used by tests and shells without durable storage.
#[derive(Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.map.read().keys().cloned().collect())
    }
}

/// Best-effort local copy of the last successfully loaded canonical
/// profile's display fields. Seed material for degraded fallbacks only,
/// never authoritative; overwritten on every canonical load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedProfileSnapshot {
    pub user_id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    pub role: Role,
    pub cached_at: DateTime<Utc>,
}

impl CachedProfileSnapshot {
    /// Load the snapshot, but only if it belongs to `user_id`. A snapshot
    /// keyed to another identity is never valid seed material.
    pub fn load_for(store: &dyn LocalStore, user_id: &str) -> Option<CachedProfileSnapshot> {
        let raw = store.get(PROFILE_SNAPSHOT_KEY).ok().flatten()?;
        let snap: CachedProfileSnapshot = serde_json::from_str(&raw).ok()?;
        if snap.user_id == user_id {
            Some(snap)
        } else {
            None
        }
    }

    pub fn save(&self, store: &dyn LocalStore) -> Result<()> {
        let raw = serde_json::to_string(self)?;
        store.set(PROFILE_SNAPSHOT_KEY, &raw)
    }
}

fn is_auth_key(key: &str) -> bool {
    AUTH_KEY_PREFIXES.iter().any(|p| key.starts_with(p))
        || AUTH_KEY_INFIXES.iter().any(|i| key.contains(i))
        || APP_CACHE_KEYS.contains(&key)
}

/// Remove every persisted key related to the session. Idempotent and safe
/// when no session exists; a failing key is skipped, the sweep continues.
/// Returns the number of keys removed.
pub fn sanitize_session_storage(store: &dyn LocalStore) -> usize {
    let keys = match store.keys() {
        Ok(keys) => keys,
        Err(e) => {
            warn!(error = %e, "storage sanitize: key enumeration failed");
            return 0;
        }
    };
    let mut removed = 0usize;
    for key in keys.iter().filter(|k| is_auth_key(k)) {
        match store.remove(key) {
            Ok(()) => removed += 1,
            Err(e) => warn!(key = %key, error = %e, "storage sanitize: remove failed"),
        }
    }
    removed
}

/// Inspect persisted artifacts for signs that they belong to an identity
/// other than `incoming_user_id`. Missing artifacts are clean; a mismatch
/// on any redundant copy is contamination.
pub fn detect_contamination(store: &dyn LocalStore, incoming_user_id: &str) -> bool {
    if let Ok(Some(raw)) = store.get(PROFILE_SNAPSHOT_KEY) {
        if let Ok(snap) = serde_json::from_str::<CachedProfileSnapshot>(&raw) {
            if snap.user_id != incoming_user_id {
                warn!(
                    cached = %snap.user_id,
                    incoming = %incoming_user_id,
                    "session contamination: profile snapshot keyed to a different identity"
                );
                return true;
            }
        }
    }
    if let Ok(Some(last)) = store.get(LAST_USER_KEY) {
        if last != incoming_user_id {
            warn!(
                cached = %last,
                incoming = %incoming_user_id,
                "session contamination: last-user marker mismatch"
            );
            return true;
        }
    }
    false
}
