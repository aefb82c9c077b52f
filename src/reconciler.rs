//! The session reconciler: owns the single authoritative identity/session
//! pair and drives every transition around it. Provider events are
//! deduplicated and serialized through a reentrancy guard; profile loading
//! is raced against a watchdog ceiling so the UI can never hang in a
//! loading state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{classify, classify_anyhow, AuthErrorCode, AuthResult, ErrorClassification, Severity};
use crate::identity::{
    ActivityEntry, ActivityLog, AuthChange, AuthEvent, Credentials, ExternalSession, Identity,
    IdentityProvider, ProfileRecord, ProfileStore, Role, SignUpRequest,
};
use crate::profile::{identity_from_record, BackoffPolicy, ProfileLoader};
use crate::storage::{detect_contamination, sanitize_session_storage, LocalStore, LAST_USER_KEY};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilerState {
    Initializing,
    Unauthenticated,
    /// Provider says authenticated; identity not yet committed.
    Reconciling,
    Authenticated,
    SigningOut,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Watchdog ceiling on a full reconciliation pass.
    pub reconcile_ceiling: Duration,
    /// Backoff for profile loads on the interactive sign-in path.
    pub interactive_backoff: BackoffPolicy,
    /// Backoff for event-stream and refresh loads.
    pub background_backoff: BackoffPolicy,
    /// Identifiers allowed to receive the admin role in degraded fallbacks.
    /// Ships empty; deployments opt in explicitly.
    pub admin_fallback_allowlist: Vec<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        ReconcilerConfig {
            reconcile_ceiling: Duration::from_secs(10),
            interactive_backoff: BackoffPolicy::interactive(),
            background_backoff: BackoffPolicy::background(),
            admin_fallback_allowlist: Vec::new(),
        }
    }
}

struct Resident {
    state: ReconcilerState,
    identity: Option<Arc<Identity>>,
    session: Option<ExternalSession>,
    last_error: Option<ErrorClassification>,
}

pub struct SessionReconciler {
    provider: Arc<dyn IdentityProvider>,
    activity: Arc<dyn ActivityLog>,
    profiles: Arc<dyn ProfileStore>,
    local: Arc<dyn LocalStore>,
    loader: Arc<ProfileLoader>,
    config: ReconcilerConfig,
    resident: Arc<RwLock<Resident>>,
    /// Reentrancy guard: at most one reconciliation in flight.
    reconcile_lock: tokio::sync::Mutex<()>,
    /// Events that arrived mid-reconciliation, replayed FIFO.
    deferred: Mutex<VecDeque<AuthChange>>,
    /// Bumped on every contamination-forced reset. Consumers treat a bump
    /// as "reload the entry point".
    reset_generation: AtomicU64,
}

impl SessionReconciler {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        activity: Arc<dyn ActivityLog>,
        local: Arc<dyn LocalStore>,
        config: ReconcilerConfig,
    ) -> Self {
        let loader = ProfileLoader::new(profiles.clone(), local.clone())
            .with_admin_fallback_allowlist(config.admin_fallback_allowlist.clone());
        SessionReconciler {
            provider,
            activity,
            profiles,
            local,
            loader: Arc::new(loader),
            config,
            resident: Arc::new(RwLock::new(Resident {
                state: ReconcilerState::Initializing,
                identity: None,
                session: None,
                last_error: None,
            })),
            reconcile_lock: tokio::sync::Mutex::new(()),
            deferred: Mutex::new(VecDeque::new()),
            reset_generation: AtomicU64::new(0),
        }
    }

    // ---- startup -----------------------------------------------------

    /// Startup session probe. Does NOT load the profile; the event stream
    /// owns that, so the probe and the first event cannot race each other
    /// for the same identity.
    pub async fn initialize(&self) {
        let _guard = self.reconcile_lock.lock().await;
        match self.provider.get_session().await {
            Ok(Some(session)) if session.is_expired(chrono::Utc::now()) => {
                warn!(user = %session.user.id, "startup probe found expired session, forcing sign-out");
                if let Err(e) = self.provider.sign_out().await {
                    warn!(error = %e, "provider sign-out for expired session failed");
                }
                sanitize_session_storage(self.local.as_ref());
                self.set_state(ReconcilerState::Unauthenticated);
            }
            Ok(Some(session)) => {
                info!(user = %session.user.id, "startup probe found live session");
                {
                    let mut res = self.resident.write();
                    res.session = Some(session.clone());
                    res.state = ReconcilerState::Reconciling;
                }
                self.arm_startup_watchdog(session);
            }
            Ok(None) => self.set_state(ReconcilerState::Unauthenticated),
            Err(e) => {
                let c = classify_anyhow(&e);
                warn!(code = c.code.as_str(), "startup session probe failed");
                let mut res = self.resident.write();
                res.last_error = Some(c);
                res.state = ReconcilerState::Unauthenticated;
            }
        }
        drop(_guard);
        self.drain_deferred().await;
    }

    // ---- event stream ------------------------------------------------

    /// Drain a provider event channel in arrival order. Single consumer.
    pub async fn run_event_loop(&self, mut rx: mpsc::Receiver<AuthChange>) {
        while let Some(change) = rx.recv().await {
            self.handle_event(change).await;
        }
    }

    /// Handle one provider event. An event arriving while another is
    /// mid-reconciliation is deferred, not dropped, and re-evaluated once
    /// the in-flight pass completes.
    pub async fn handle_event(&self, change: AuthChange) {
        match self.reconcile_lock.try_lock() {
            Ok(_guard) => {
                self.process_event(change).await;
                loop {
                    let next = self.deferred.lock().pop_front();
                    match next {
                        Some(c) => self.process_event(c).await,
                        None => break,
                    }
                }
            }
            Err(_) => {
                debug!(event = ?change.event, "reconciliation in flight, deferring event");
                self.deferred.lock().push_back(change);
            }
        }
    }

    async fn drain_deferred(&self) {
        if let Ok(_guard) = self.reconcile_lock.try_lock() {
            loop {
                let next = self.deferred.lock().pop_front();
                match next {
                    Some(c) => self.process_event(c).await,
                    None => break,
                }
            }
        }
    }

    /// Caller holds the reentrancy guard.
    async fn process_event(&self, change: AuthChange) {
        match (change.event, change.session) {
            // Initialization owns the bootstrap event.
            (AuthEvent::Bootstrap, _) => debug!("ignoring bootstrap event"),
            (AuthEvent::PasswordRecovery, _) => {
                info!("password recovery event observed, provider owns the flow")
            }
            (AuthEvent::SignedOut, _) => self.clear_to_unauthenticated().await,
            (_, None) => self.clear_to_unauthenticated().await,
            (event, Some(session)) => {
                let resident_id = self.resident.read().identity.as_ref().map(|i| i.id.clone());
                match resident_id {
                    Some(id) if id == session.user.id => {
                        if event == AuthEvent::UserUpdated {
                            // Metadata-only update for the resident identity
                            // does not represent a new sign-in.
                            debug!(user = %id, "ignoring metadata update for resident identity");
                        } else {
                            // Redundant sign-in/refresh: replace the stored
                            // session copy only. The resident identity stays
                            // untouched, so no flicker and no backend call.
                            debug!(user = %id, "redundant event, updating session copy only");
                            self.resident.write().session = Some(session);
                        }
                    }
                    _ => self.reconcile_session(session, self.config.background_backoff).await,
                }
            }
        }
    }

    /// Full reconciliation for a session the provider vouches for. Caller
    /// holds the reentrancy guard.
    async fn reconcile_session(&self, session: ExternalSession, policy: BackoffPolicy) {
        self.set_state(ReconcilerState::Reconciling);
        let user_id = session.user.id.clone();

        if detect_contamination(self.local.as_ref(), &user_id) {
            self.forced_reset(&user_id).await;
            return;
        }

        // Watchdog: never stay in Reconciling past the ceiling. On expiry
        // commit a degraded fallback rather than hang; the slower load's
        // eventual result is dropped with its future and never applied.
        let load = self.loader.load_with_retry(&session, policy);
        let (identity, load_error) =
            match tokio::time::timeout(self.config.reconcile_ceiling, load).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(user = %user_id, "reconciliation watchdog fired, committing fallback");
                    let fallback = self.loader.fallback_identity(&session);
                    (fallback, Some(classify("reconciliation timed out")))
                }
            };

        if let Err(e) = self.local.set(LAST_USER_KEY, &user_id) {
            warn!(error = %e, "last-user marker write failed");
        }
        let mut res = self.resident.write();
        res.identity = Some(Arc::new(identity));
        res.session = Some(session);
        res.last_error = load_error;
        res.state = ReconcilerState::Authenticated;
        drop(res);
        info!(user = %user_id, "identity committed");
    }

    /// Contamination is a correctness violation; partial cleanup cannot be
    /// proven safe, so destroy everything and signal an entry-point reload.
    async fn forced_reset(&self, incoming_user_id: &str) {
        warn!(incoming = %incoming_user_id, "contaminated local state, forcing full reset");
        {
            let mut res = self.resident.write();
            res.identity = None;
            res.session = None;
            res.state = ReconcilerState::SigningOut;
        }
        sanitize_session_storage(self.local.as_ref());
        if let Err(e) = self.provider.sign_out().await {
            warn!(error = %e, "provider sign-out during forced reset failed");
        }
        self.set_state(ReconcilerState::Unauthenticated);
        self.reset_generation.fetch_add(1, Ordering::SeqCst);
    }

    async fn clear_to_unauthenticated(&self) {
        let user = {
            let mut res = self.resident.write();
            let user = res.identity.as_ref().map(|i| i.id.clone());
            res.identity = None;
            res.session = None;
            res.state = ReconcilerState::SigningOut;
            user
        };
        // Best-effort: a failing key never aborts the sweep, and a failing
        // sweep never blocks the transition.
        sanitize_session_storage(self.local.as_ref());
        self.set_state(ReconcilerState::Unauthenticated);
        if let Some(user) = user {
            self.audit(&user, "auth.signed_out").await;
        }
    }

    // ---- operations --------------------------------------------------

    /// Create a new external identity plus its canonical profile record.
    /// The returned identity is not committed as the active session; that
    /// happens through the event stream once the provider confirms it.
    pub async fn sign_up(&self, req: &SignUpRequest) -> AuthResult<Identity> {
        let session = match self.provider.sign_up(req).await {
            Ok(s) => s,
            Err(e) => {
                let c = classify_anyhow(&e);
                warn!(code = c.code.as_str(), "sign-up failed at provider");
                return Err(c);
            }
        };

        let now = chrono::Utc::now();
        let record = ProfileRecord {
            id: session.user.id.clone(),
            email: req.email.clone(),
            display_name: req.full_name.clone(),
            avatar_url: None,
            role: req.role,
            verified: session.user.email_confirmed_at.is_some(),
            active: true,
            onboarding_complete: false,
            created_at: now,
            updated_at: now,
        };
        // Profile creation fails closed: an account without a canonical
        // record is worse than a failed sign-up.
        if let Err(e) = self.profiles.upsert(&record).await {
            let c = ErrorClassification::for_code(
                AuthErrorCode::ProfileCreationFailed,
                format!("{:#}", e),
            );
            warn!(user = %record.id, "profile creation failed during sign-up");
            return Err(c);
        }
        self.audit(&record.id, "auth.signed_up").await;
        Ok(identity_from_record(&record))
    }

    /// Authenticate and reconcile. Any leftover local state from a previous
    /// user on this device is cleared before the provider is contacted.
    pub async fn sign_in(&self, creds: &Credentials) -> AuthResult<Arc<Identity>> {
        let _guard = self.reconcile_lock.lock().await;
        {
            // The label moves with the identity: readers must never see
            // `Authenticated` while the resident identity is cleared.
            let mut res = self.resident.write();
            res.identity = None;
            res.session = None;
            res.last_error = None;
            res.state = ReconcilerState::Reconciling;
        }
        sanitize_session_storage(self.local.as_ref());

        let session = match self.provider.sign_in(creds).await {
            Ok(s) => s,
            Err(e) => {
                let c = classify_anyhow(&e);
                warn!(code = c.code.as_str(), "sign-in failed");
                self.apply_failure_policy(&c);
                self.set_state(ReconcilerState::Unauthenticated);
                return Err(c);
            }
        };
        self.reconcile_session(session, self.config.interactive_backoff).await;
        drop(_guard);
        self.drain_deferred().await;

        let (identity, last_error) = {
            let res = self.resident.read();
            (res.identity.clone(), res.last_error.clone())
        };
        match identity {
            Some(identity) => {
                self.audit(&identity.id, "auth.signed_in").await;
                Ok(identity)
            }
            // Contamination reset mid-sign-in: surface a session error.
            None => Err(last_error.unwrap_or_else(|| classify("invalid session"))),
        }
    }

    /// Sign out. Local state is cleared immediately and synchronously; the
    /// provider notification and storage purge are best-effort. This
    /// operation never fails from the caller's perspective.
    pub async fn sign_out(&self) {
        let user = {
            let mut res = self.resident.write();
            let user = res.identity.as_ref().map(|i| i.id.clone());
            res.identity = None;
            res.session = None;
            res.last_error = None;
            res.state = ReconcilerState::SigningOut;
            user
        };
        sanitize_session_storage(self.local.as_ref());
        if let Err(e) = self.provider.sign_out().await {
            warn!(error = %e, "provider sign-out failed, local state already cleared");
        }
        self.set_state(ReconcilerState::Unauthenticated);
        if let Some(user) = user {
            self.audit(&user, "auth.signed_out").await;
        }
    }

    /// Re-run the profile load for the resident session without changing
    /// the state machine. Picks up out-of-band profile edits.
    pub async fn refresh_identity(&self) {
        let _guard = self.reconcile_lock.lock().await;
        let Some(session) = self.resident.read().session.clone() else {
            return;
        };
        let (identity, load_error) = self
            .loader
            .load_with_retry(&session, self.config.background_backoff)
            .await;
        let mut res = self.resident.write();
        res.identity = Some(Arc::new(identity));
        res.last_error = load_error;
        drop(res);
        drop(_guard);
        self.drain_deferred().await;
    }

    // ---- accessors ---------------------------------------------------

    pub fn current_identity(&self) -> Option<Arc<Identity>> {
        self.resident.read().identity.clone()
    }

    pub fn current_session(&self) -> Option<ExternalSession> {
        self.resident.read().session.clone()
    }

    pub fn state(&self) -> ReconcilerState {
        self.resident.read().state
    }

    /// Loading flag for route guards.
    pub fn is_reconciling(&self) -> bool {
        matches!(self.state(), ReconcilerState::Initializing | ReconcilerState::Reconciling)
    }

    pub fn last_error(&self) -> Option<ErrorClassification> {
        self.resident.read().last_error.clone()
    }

    /// Incremented by every contamination-forced reset.
    pub fn reset_generation(&self) -> u64 {
        self.reset_generation.load(Ordering::SeqCst)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.resident.read().identity.as_ref().is_some_and(|i| i.has_role(role))
    }

    pub fn has_any_role(&self, roles: &[Role]) -> bool {
        self.resident.read().identity.as_ref().is_some_and(|i| i.has_any_role(roles))
    }

    pub fn is_verified(&self) -> bool {
        self.resident.read().identity.as_ref().is_some_and(|i| i.verified)
    }

    // ---- internals ---------------------------------------------------

    fn set_state(&self, state: ReconcilerState) {
        self.resident.write().state = state;
    }

    /// The startup probe enters `Reconciling` without loading the profile;
    /// the follow-up provider event normally finishes the job. If that event
    /// never arrives, this timer commits a degraded fallback at the ceiling
    /// so route guards cannot spin forever. A reconciliation that completes
    /// first, or any transition out of `Reconciling`, disarms it.
    fn arm_startup_watchdog(&self, session: ExternalSession) {
        let resident = self.resident.clone();
        let loader = self.loader.clone();
        let local = self.local.clone();
        let ceiling = self.config.reconcile_ceiling;
        tokio::spawn(async move {
            tokio::time::sleep(ceiling).await;
            {
                let res = resident.read();
                if res.state != ReconcilerState::Reconciling || res.identity.is_some() {
                    return;
                }
            }
            warn!(user = %session.user.id, "startup reconciliation watchdog fired, committing fallback");
            let fallback = loader.fallback_identity(&session);
            if let Err(e) = local.set(LAST_USER_KEY, &session.user.id) {
                warn!(error = %e, "last-user marker write failed");
            }
            let mut res = resident.write();
            if res.state != ReconcilerState::Reconciling || res.identity.is_some() {
                return;
            }
            res.identity = Some(Arc::new(fallback));
            res.last_error = Some(classify("reconciliation timed out"));
            res.state = ReconcilerState::Authenticated;
        });
    }

    /// High/critical failures tagged for logout clear local state; anything
    /// else is surfaced to the caller and recovered locally.
    fn apply_failure_policy(&self, c: &ErrorClassification) {
        if c.should_logout && c.severity >= Severity::High {
            let mut res = self.resident.write();
            res.identity = None;
            res.session = None;
            res.state = ReconcilerState::Unauthenticated;
            drop(res);
            sanitize_session_storage(self.local.as_ref());
        }
    }

    async fn audit(&self, user_id: &str, action: &str) {
        let entry = ActivityEntry::now(user_id, action);
        if let Err(e) = self.activity.record(&entry).await {
            debug!(error = %e, action, "activity log write failed");
        }
    }
}
