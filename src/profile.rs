//! Profile loading with bounded retries and degraded fallback. The contract
//! at this boundary: the caller always receives a usable [`Identity`], never
//! an error. Canonical loads win; when the profile store is slow or down we
//! synthesize an identity from local cache and session metadata instead of
//! blocking sign-in on a degraded backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{classify_anyhow, ErrorClassification};
use crate::identity::{ExternalSession, Identity, ProfileRecord, ProfileStore, Provenance, Role};
use crate::storage::{CachedProfileSnapshot, LocalStore};

/// Explicit retry schedule: `attempts` tries, linear backoff (`delay` *
/// attempt number) between them, each fetch raced against `fetch_timeout`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub fetch_timeout: Duration,
}

impl BackoffPolicy {
    /// Short timeout for interactive sign-in, where a spinner is on screen.
    pub fn interactive() -> Self {
        BackoffPolicy { attempts: 3, delay: Duration::from_millis(400), fetch_timeout: Duration::from_secs(3) }
    }

    /// Longer timeout for background refreshes.
    pub fn background() -> Self {
        BackoffPolicy { attempts: 3, delay: Duration::from_secs(1), fetch_timeout: Duration::from_secs(8) }
    }
}

/// Loads canonical profiles and synthesizes fallbacks.
pub struct ProfileLoader {
    profiles: Arc<dyn ProfileStore>,
    local: Arc<dyn LocalStore>,
    /// Identifiers (user id or email) permitted to receive the admin role in
    /// a fallback identity. Empty unless a deployment explicitly opts in.
    admin_fallback_allowlist: Vec<String>,
}

impl ProfileLoader {
    pub fn new(profiles: Arc<dyn ProfileStore>, local: Arc<dyn LocalStore>) -> Self {
        ProfileLoader { profiles, local, admin_fallback_allowlist: Vec::new() }
    }

    pub fn with_admin_fallback_allowlist(mut self, allowlist: Vec<String>) -> Self {
        self.admin_fallback_allowlist = allowlist;
        self
    }

    /// One canonical attempt: fetch raced against the timeout. A fetch that
    /// completes after the deadline is dropped by the race and its result is
    /// never applied.
    pub async fn load_canonical(
        &self,
        session: &ExternalSession,
        fetch_timeout: Duration,
    ) -> Result<Identity, ErrorClassification> {
        let fetched = tokio::time::timeout(fetch_timeout, self.profiles.fetch(&session.user.id)).await;
        match fetched {
            Ok(Ok(Some(record))) => {
                let identity = identity_from_record(&record);
                let snap = CachedProfileSnapshot {
                    user_id: identity.id.clone(),
                    display_name: identity.display_name.clone(),
                    avatar_url: identity.avatar_url.clone(),
                    role: identity.role,
                    cached_at: Utc::now(),
                };
                if let Err(e) = snap.save(self.local.as_ref()) {
                    warn!(error = %e, "profile snapshot write failed");
                }
                Ok(identity)
            }
            Ok(Ok(None)) => Err(crate::error::classify("profile not found")),
            Ok(Err(e)) => Err(classify_anyhow(&e)),
            Err(_) => Err(crate::error::classify(&format!(
                "profile fetch timed out after {:?}",
                fetch_timeout
            ))),
        }
    }

    /// Retrying variant: up to `policy.attempts` canonical attempts with
    /// linear backoff, then fallback. Non-retryable failures skip straight
    /// to fallback. Never fails; the second tuple element carries the
    /// classification of the last failure when the result is a fallback.
    pub async fn load_with_retry(
        &self,
        session: &ExternalSession,
        policy: BackoffPolicy,
    ) -> (Identity, Option<ErrorClassification>) {
        let mut last: Option<ErrorClassification> = None;
        for attempt in 1..=policy.attempts.max(1) {
            match self.load_canonical(session, policy.fetch_timeout).await {
                Ok(identity) => {
                    debug!(user = %identity.id, attempt, "canonical profile loaded");
                    return (identity, None);
                }
                Err(c) => {
                    let retry = c.should_retry;
                    last = Some(c);
                    if !retry {
                        break;
                    }
                    if attempt < policy.attempts {
                        tokio::time::sleep(policy.delay * attempt).await;
                    }
                }
            }
        }
        let classification = last.unwrap_or_else(|| crate::error::classify("profile not found"));
        warn!(
            user = %session.user.id,
            code = classification.code.as_str(),
            "profile load exhausted, constructing degraded fallback"
        );
        (self.fallback_identity(session), Some(classification))
    }

    /// The "simple" variant: synthesize a best-effort identity without
    /// touching the profile store. Seed priority: matching cached snapshot,
    /// then session metadata, then defaults derived from the email.
    pub fn fallback_identity(&self, session: &ExternalSession) -> Identity {
        let user = &session.user;
        let snapshot = CachedProfileSnapshot::load_for(self.local.as_ref(), &user.id);

        let meta_name = user
            .user_metadata
            .get("full_name")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let meta_avatar = user
            .user_metadata
            .get("avatar_url")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let meta_role = user
            .app_metadata
            .get("role")
            .and_then(|v| v.as_str())
            .map(Role::parse);

        let display_name = snapshot
            .as_ref()
            .map(|s| s.display_name.clone())
            .or(meta_name)
            .unwrap_or_else(|| email_local_part(&user.email));
        let avatar_url = snapshot.as_ref().and_then(|s| s.avatar_url.clone()).or(meta_avatar);

        // Least privilege unless the session metadata (or the explicit
        // allowlist) says otherwise. The snapshot may also carry a role, but
        // only a non-admin one is honored from cache.
        let mut role = meta_role
            .or_else(|| snapshot.as_ref().map(|s| s.role).filter(|r| *r != Role::Admin))
            .unwrap_or(Role::Donor);
        if self.admin_fallback_allowlist.iter().any(|a| a == &user.id || a == &user.email) {
            role = Role::Admin;
        }

        let now = Utc::now();
        Identity {
            id: user.id.clone(),
            email: user.email.clone(),
            display_name,
            avatar_url,
            role,
            verified: user.email_confirmed_at.is_some(),
            active: true,
            onboarding_complete: false,
            provenance: Provenance::DegradedFallback,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Map a canonical profile record to the application-facing identity.
pub fn identity_from_record(record: &ProfileRecord) -> Identity {
    Identity {
        id: record.id.clone(),
        email: record.email.clone(),
        display_name: record.display_name.clone(),
        avatar_url: record.avatar_url.clone(),
        role: record.role,
        verified: record.verified,
        active: record.active,
        onboarding_complete: record.onboarding_complete,
        provenance: Provenance::Canonical,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

fn email_local_part(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    if local.is_empty() { "Member".to_string() } else { local.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityRef;
    use crate::storage::MemoryStore;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyStore {
        calls: AtomicUsize,
        fail_first: usize,
        record: Option<ProfileRecord>,
    }

    #[async_trait]
    impl ProfileStore for FlakyStore {
        async fn fetch(&self, _user_id: &str) -> Result<Option<ProfileRecord>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("network error: connection reset");
            }
            Ok(self.record.clone())
        }
        async fn upsert(&self, _record: &ProfileRecord) -> Result<()> {
            Ok(())
        }
        async fn update_fields(&self, _user_id: &str, _patch: &serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    fn session_for(id: &str, email: &str) -> ExternalSession {
        ExternalSession {
            user: IdentityRef {
                id: id.into(),
                email: email.into(),
                email_confirmed_at: None,
                user_metadata: json!({"full_name": "Meta Name"}),
                app_metadata: json!({}),
            },
            expires_at: Utc::now() + ChronoDuration::hours(1),
            provider_meta: json!({}),
        }
    }

    fn record_for(id: &str) -> ProfileRecord {
        ProfileRecord {
            id: id.into(),
            email: format!("{id}@example.org"),
            display_name: "Canonical Name".into(),
            avatar_url: None,
            role: Role::Charity,
            verified: true,
            active: true,
            onboarding_complete: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn fast_policy(attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            attempts,
            delay: Duration::from_millis(1),
            fetch_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn canonical_load_writes_snapshot() {
        let local = Arc::new(MemoryStore::new());
        let profiles = Arc::new(FlakyStore {
            calls: AtomicUsize::new(0),
            fail_first: 0,
            record: Some(record_for("u1")),
        });
        let loader = ProfileLoader::new(profiles, local.clone());
        let sess = session_for("u1", "u1@example.org");

        let (identity, err) = loader.load_with_retry(&sess, fast_policy(3)).await;
        assert!(err.is_none());
        assert_eq!(identity.provenance, Provenance::Canonical);
        assert_eq!(identity.role, Role::Charity);
        let snap = CachedProfileSnapshot::load_for(local.as_ref(), "u1").expect("snapshot");
        assert_eq!(snap.display_name, "Canonical Name");
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let profiles = Arc::new(FlakyStore {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            record: Some(record_for("u1")),
        });
        let loader = ProfileLoader::new(profiles.clone(), Arc::new(MemoryStore::new()));
        let sess = session_for("u1", "u1@example.org");

        let (identity, err) = loader.load_with_retry(&sess, fast_policy(3)).await;
        assert!(err.is_none());
        assert_eq!(identity.provenance, Provenance::Canonical);
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_degrades_to_fallback() {
        let profiles = Arc::new(FlakyStore {
            calls: AtomicUsize::new(0),
            fail_first: 100,
            record: None,
        });
        let loader = ProfileLoader::new(profiles, Arc::new(MemoryStore::new()));
        let sess = session_for("u1", "alice.b@example.org");

        let (identity, err) = loader.load_with_retry(&sess, fast_policy(2)).await;
        assert_eq!(identity.provenance, Provenance::DegradedFallback);
        assert_eq!(identity.role, Role::Donor);
        assert!(err.is_some());
    }

    #[test]
    fn fallback_prefers_matching_snapshot_over_metadata() {
        let local = Arc::new(MemoryStore::new());
        CachedProfileSnapshot {
            user_id: "u1".into(),
            display_name: "Cached Name".into(),
            avatar_url: Some("https://cdn/a.png".into()),
            role: Role::Charity,
            cached_at: Utc::now(),
        }
        .save(local.as_ref())
        .unwrap();
        let loader = ProfileLoader::new(
            Arc::new(FlakyStore { calls: AtomicUsize::new(0), fail_first: 0, record: None }),
            local,
        );

        let identity = loader.fallback_identity(&session_for("u1", "u1@example.org"));
        assert_eq!(identity.display_name, "Cached Name");
        assert_eq!(identity.role, Role::Charity);
        assert_eq!(identity.provenance, Provenance::DegradedFallback);
    }

    #[test]
    fn fallback_ignores_snapshot_for_other_identity() {
        let local = Arc::new(MemoryStore::new());
        CachedProfileSnapshot {
            user_id: "someone-else".into(),
            display_name: "Cached Name".into(),
            avatar_url: None,
            role: Role::Charity,
            cached_at: Utc::now(),
        }
        .save(local.as_ref())
        .unwrap();
        let loader = ProfileLoader::new(
            Arc::new(FlakyStore { calls: AtomicUsize::new(0), fail_first: 0, record: None }),
            local,
        );

        let identity = loader.fallback_identity(&session_for("u1", "u1@example.org"));
        // Falls through to session metadata.
        assert_eq!(identity.display_name, "Meta Name");
        assert_eq!(identity.role, Role::Donor);
    }

    #[test]
    fn fallback_derives_name_from_email_local_part() {
        let loader = ProfileLoader::new(
            Arc::new(FlakyStore { calls: AtomicUsize::new(0), fail_first: 0, record: None }),
            Arc::new(MemoryStore::new()),
        );
        let mut sess = session_for("u1", "alice.b@example.org");
        sess.user.user_metadata = json!({});
        let identity = loader.fallback_identity(&sess);
        assert_eq!(identity.display_name, "alice.b");
        assert!(!identity.verified);
    }

    #[test]
    fn admin_fallback_requires_explicit_allowlist() {
        let mk = |allow: Vec<String>| {
            ProfileLoader::new(
                Arc::new(FlakyStore { calls: AtomicUsize::new(0), fail_first: 0, record: None }),
                Arc::new(MemoryStore::new()),
            )
            .with_admin_fallback_allowlist(allow)
        };
        let sess = session_for("u1", "ops@donorlink.org");

        let identity = mk(vec![]).fallback_identity(&sess);
        assert_eq!(identity.role, Role::Donor);

        let identity = mk(vec!["ops@donorlink.org".into()]).fallback_identity(&sess);
        assert_eq!(identity.role, Role::Admin);
    }

    #[test]
    fn cached_admin_role_is_not_honored_without_allowlist() {
        let local = Arc::new(MemoryStore::new());
        CachedProfileSnapshot {
            user_id: "u1".into(),
            display_name: "Cached Admin".into(),
            avatar_url: None,
            role: Role::Admin,
            cached_at: Utc::now(),
        }
        .save(local.as_ref())
        .unwrap();
        let loader = ProfileLoader::new(
            Arc::new(FlakyStore { calls: AtomicUsize::new(0), fail_first: 0, record: None }),
            local,
        );
        let mut sess = session_for("u1", "u1@example.org");
        sess.user.user_metadata = json!({});
        let identity = loader.fallback_identity(&sess);
        assert_eq!(identity.display_name, "Cached Admin");
        assert_eq!(identity.role, Role::Donor);
    }
}
