//! Heuristic security validation over a materialized identity and its
//! session metadata. Checks gather independently; the merged verdict takes
//! the worst severity seen, never an average.

use std::sync::Arc;

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Severity;
use crate::identity::{ActivityLog, Identity, ProfileStore, SessionMeta};

/// Sessions older than this are flagged.
const MAX_SESSION_AGE: Duration = Duration::hours(24);
/// Idle windows longer than this are flagged at lower severity.
const MAX_IDLE: Duration = Duration::hours(2);
/// Behavioral ceiling: events per trailing 5 minutes.
const ACTIVITY_WINDOW: Duration = Duration::minutes(5);
const ACTIVITY_CEILING: usize = 100;
/// Failed sign-ins per trailing 15 minutes.
const FAILED_LOGIN_WINDOW: Duration = Duration::minutes(15);
const FAILED_LOGIN_CEILING: usize = 5;
/// Rate limit: entries per trailing minute.
const RATE_WINDOW: Duration = Duration::minutes(1);
const RATE_CEILING: usize = 30;

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex"));

static SCRIPT_RES: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)<\s*script",
        r"(?i)javascript:",
        r"(?i)\bon\w+\s*=",
        r"(?i)data:text/html",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("script regex"))
    .collect()
});

static AUTOMATION_UA_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)headless|bot|crawler|curl|wget|python-requests|phantomjs|selenium")
        .expect("ua regex")
});

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictAction {
    Allow,
    Warn,
    Block,
    Logout,
}

/// Merged result of one validation run. Consumed once by the caller, never
/// persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecurityVerdict {
    pub is_valid: bool,
    pub issues: Vec<String>,
    pub severity: Severity,
    pub action: VerdictAction,
}

impl SecurityVerdict {
    fn allow() -> Self {
        SecurityVerdict { is_valid: true, issues: Vec::new(), severity: Severity::Low, action: VerdictAction::Allow }
    }

    fn fail_closed(issue: impl Into<String>) -> Self {
        SecurityVerdict {
            is_valid: false,
            issues: vec![issue.into()],
            severity: Severity::High,
            action: VerdictAction::Block,
        }
    }
}

struct Finding {
    issue: String,
    severity: Severity,
    block: bool,
}

impl Finding {
    fn new(issue: impl Into<String>, severity: Severity) -> Self {
        Finding { issue: issue.into(), severity, block: false }
    }

    fn blocking(issue: impl Into<String>, severity: Severity) -> Self {
        Finding { issue: issue.into(), severity, block: true }
    }
}

pub struct SecurityValidator {
    profiles: Arc<dyn ProfileStore>,
    activity: Arc<dyn ActivityLog>,
}

impl SecurityValidator {
    pub fn new(profiles: Arc<dyn ProfileStore>, activity: Arc<dyn ActivityLog>) -> Self {
        SecurityValidator { profiles, activity }
    }

    pub async fn validate(&self, identity: &Identity, meta: Option<&SessionMeta>) -> SecurityVerdict {
        let mut findings: Vec<Finding> = Vec::new();

        match self.check_profile_integrity(identity).await {
            Ok(fs) => findings.extend(fs),
            Err(verdict) => return verdict,
        }
        findings.extend(check_content_safety(identity));
        if let Some(meta) = meta {
            findings.extend(check_session_age(meta));
            findings.extend(check_user_agent(meta));
        }
        match self.check_behavior(identity).await {
            Ok(fs) => findings.extend(fs),
            Err(verdict) => return verdict,
        }
        findings.extend(self.check_rate_limit(identity).await);

        merge(findings)
    }

    /// Required fields, email shape, and cross-check against the backing
    /// profile record. Store failures fail closed.
    async fn check_profile_integrity(&self, identity: &Identity) -> Result<Vec<Finding>, SecurityVerdict> {
        let mut findings = Vec::new();
        if identity.id.is_empty() || identity.email.is_empty() || identity.display_name.is_empty() {
            findings.push(Finding::new("profile missing required fields", Severity::Critical));
        }
        if !identity.email.is_empty() && !EMAIL_RE.is_match(&identity.email) {
            findings.push(Finding::new("email address is malformed", Severity::High));
        }
        if !identity.verified {
            findings.push(Finding::blocking("email address not verified", Severity::Medium));
        }

        match self.profiles.fetch(&identity.id).await {
            Ok(Some(record)) => {
                if !record.active {
                    findings.push(Finding::new("backing profile is deactivated", Severity::Critical));
                }
                if !record.email.eq_ignore_ascii_case(&identity.email) {
                    findings.push(Finding::new("email does not match backing profile", Severity::Critical));
                }
            }
            Ok(None) => {
                // A degraded identity legitimately has no record yet;
                // a canonical one without a record is a hard failure.
                if !identity.is_degraded() {
                    findings.push(Finding::new("backing profile record missing", Severity::Critical));
                }
            }
            Err(e) => {
                warn!(error = %e, "profile integrity cross-check failed");
                return Err(SecurityVerdict::fail_closed("profile store unavailable during validation"));
            }
        }
        Ok(findings)
    }

    /// Event-volume and failed-login checks. Log failures fail closed.
    async fn check_behavior(&self, identity: &Identity) -> Result<Vec<Finding>, SecurityVerdict> {
        let mut findings = Vec::new();
        match self.activity.count_since(&identity.id, ACTIVITY_WINDOW).await {
            Ok(n) if n > ACTIVITY_CEILING => {
                findings.push(Finding::new(
                    format!("abnormal event volume: {} in {}m", n, ACTIVITY_WINDOW.num_minutes()),
                    Severity::Medium,
                ));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "activity volume query failed");
                return Err(SecurityVerdict::fail_closed("activity log unavailable during validation"));
            }
        }
        match self.activity.failed_logins_since(&identity.id, FAILED_LOGIN_WINDOW).await {
            Ok(n) if n >= FAILED_LOGIN_CEILING => {
                findings.push(Finding::new(
                    format!("{} failed sign-in attempts in {}m", n, FAILED_LOGIN_WINDOW.num_minutes()),
                    Severity::High,
                ));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed-login query failed");
                return Err(SecurityVerdict::fail_closed("activity log unavailable during validation"));
            }
        }
        Ok(findings)
    }

    /// Rate-limit sub-check. This one fails open: a flaky log store must not
    /// collapse availability.
    async fn check_rate_limit(&self, identity: &Identity) -> Vec<Finding> {
        match self.activity.count_since(&identity.id, RATE_WINDOW).await {
            Ok(n) if n > RATE_CEILING => vec![Finding::new(
                format!("rate limit exceeded: {} entries in {}s", n, RATE_WINDOW.num_seconds()),
                Severity::High,
            )],
            Ok(_) => Vec::new(),
            Err(e) => {
                warn!(error = %e, "rate-limit query failed, treating as not limited");
                Vec::new()
            }
        }
    }
}

fn check_content_safety(identity: &Identity) -> Vec<Finding> {
    let mut findings = Vec::new();
    let fields = [
        ("display_name", identity.display_name.as_str()),
        ("avatar_url", identity.avatar_url.as_deref().unwrap_or("")),
    ];
    for (name, value) in fields {
        if SCRIPT_RES.iter().any(|re| re.is_match(value)) {
            findings.push(Finding::new(
                format!("executable content in profile field {}", name),
                Severity::High,
            ));
        }
    }
    findings
}

fn check_session_age(meta: &SessionMeta) -> Vec<Finding> {
    let now = Utc::now();
    let mut findings = Vec::new();
    if let Some(issued) = meta.issued_at {
        if now - issued > MAX_SESSION_AGE {
            findings.push(Finding::new("session exceeds maximum allowed age", Severity::Medium));
        }
    }
    if let Some(last) = meta.last_activity_at {
        if now - last > MAX_IDLE {
            findings.push(Finding::new("session idle beyond allowed window", Severity::Low));
        }
    }
    findings
}

fn check_user_agent(meta: &SessionMeta) -> Vec<Finding> {
    match meta.user_agent.as_deref() {
        None | Some("") => vec![Finding::new("missing user agent", Severity::Low)],
        Some(ua) if AUTOMATION_UA_RE.is_match(ua) => {
            vec![Finding::new("automation-pattern user agent", Severity::Medium)]
        }
        Some(_) => Vec::new(),
    }
}

fn merge(findings: Vec<Finding>) -> SecurityVerdict {
    if findings.is_empty() {
        return SecurityVerdict::allow();
    }
    let severity = findings.iter().map(|f| f.severity).max().unwrap_or(Severity::Low);
    let block = findings.iter().any(|f| f.block);
    let action = if severity == Severity::Critical {
        VerdictAction::Logout
    } else if block {
        VerdictAction::Block
    } else if severity == Severity::High {
        VerdictAction::Warn
    } else {
        VerdictAction::Allow
    };
    SecurityVerdict {
        is_valid: false,
        issues: findings.into_iter().map(|f| f.issue).collect(),
        severity,
        action,
    }
}
