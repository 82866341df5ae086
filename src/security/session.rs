//! Session and credential lifetime.
//!
//! # State Transitions
//! ```text
//! Active → Active:   touch (last_activity = now)
//! Active → Invalid:  invalidate (logout), blacklist, user sweep,
//!                    or timeout (now - last_activity >= timeout)
//! ```
//!
//! # Design Decisions
//! - Timeouts are evaluated when read; no sweeper is needed for correctness
//! - The token blacklist is the single source of truth for revoked credentials
//! - Invalid sessions are kept (flag flip) and reaped only to bound memory
//! - Tokens the registry has never seen are not valid (fail closed)

use dashmap::DashMap;
use serde::Serialize;

use crate::clock::{SharedClock, MILLIS_PER_MINUTE};
use crate::config::SessionConfig;
use crate::error::{ShieldError, ShieldResult};
use crate::observability::metrics;

/// Why a session stopped being valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationReason {
    Logout,
    Timeout,
    Blacklisted,
    UserSweep,
}

impl InvalidationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidationReason::Logout => "logout",
            InvalidationReason::Timeout => "timeout",
            InvalidationReason::Blacklisted => "blacklisted",
            InvalidationReason::UserSweep => "user_sweep",
        }
    }
}

/// An authenticated session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    pub user_agent: String,
    pub source_ip: String,
    pub created_at: u64,
    pub last_activity: u64,
    /// Stored flag; timeouts are not reflected here until observed.
    pub valid: bool,
    pub invalidated_at: Option<u64>,
    pub invalidation_reason: Option<InvalidationReason>,
}

impl Session {
    fn mark_invalid(&mut self, now: u64, reason: InvalidationReason) -> bool {
        if !self.valid {
            return false;
        }
        self.valid = false;
        self.invalidated_at = Some(now);
        self.invalidation_reason = Some(reason);
        true
    }
}

#[derive(Debug, Clone)]
struct BlacklistEntry {
    revoked_at: u64,
    /// When the token would have expired on its own.
    expires_at: u64,
}

/// Counts for the admin surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub blacklisted_tokens: usize,
}

/// Result of a memory-bounding sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionCleanup {
    pub blacklist_removed: usize,
    pub sessions_reaped: usize,
}

/// Registry of sessions and revoked tokens.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    clock: SharedClock,
    sessions: DashMap<String, Session>,
    /// access token → session id
    tokens: DashMap<String, String>,
    blacklist: DashMap<String, BlacklistEntry>,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, clock: SharedClock) -> ShieldResult<Self> {
        config.validate().map_err(ShieldError::InvalidConfig)?;
        Ok(Self {
            config,
            clock,
            sessions: DashMap::new(),
            tokens: DashMap::new(),
            blacklist: DashMap::new(),
        })
    }

    fn timeout_millis(&self) -> u64 {
        self.config.timeout_minutes.saturating_mul(MILLIS_PER_MINUTE)
    }

    fn timed_out(&self, session: &Session, now: u64) -> bool {
        now.saturating_sub(session.last_activity) >= self.timeout_millis()
    }

    fn is_blacklisted(&self, token: &str) -> bool {
        self.blacklist.contains_key(token)
    }

    fn evaluate(&self, session: &Session, now: u64) -> bool {
        session.valid && !self.is_blacklisted(&session.access_token) && !self.timed_out(session, now)
    }

    /// Register a freshly authenticated session.
    pub fn create_session(
        &self,
        user_id: &str,
        access_token: &str,
        user_agent: &str,
        source_ip: &str,
    ) -> Session {
        let now = self.clock.now_millis();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            access_token: access_token.to_string(),
            user_agent: user_agent.to_string(),
            source_ip: source_ip.to_string(),
            created_at: now,
            last_activity: now,
            valid: true,
            invalidated_at: None,
            invalidation_reason: None,
        };

        self.tokens.insert(access_token.to_string(), session.id.clone());
        self.sessions.insert(session.id.clone(), session.clone());

        tracing::info!(session_id = %session.id, user_id = %user_id, source_ip = %source_ip, "Session created");
        metrics::record_session_event("created");
        session
    }

    pub fn get_session(&self, session_id: &str) -> ShieldResult<Session> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| ShieldError::not_found("session", session_id))
    }

    /// Pure validity check; unknown sessions are invalid.
    pub fn is_valid(&self, session_id: &str) -> bool {
        let now = self.clock.now_millis();
        self.sessions
            .get(session_id)
            .map(|s| self.evaluate(&s, now))
            .unwrap_or(false)
    }

    /// Extend an active session. Returns false if it was no longer valid.
    pub fn touch(&self, session_id: &str) -> ShieldResult<bool> {
        let now = self.clock.now_millis();
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| ShieldError::not_found("session", session_id))?;

        if self.evaluate(&session, now) {
            session.last_activity = now;
            return Ok(true);
        }

        if self.timed_out(&session, now) && session.mark_invalid(now, InvalidationReason::Timeout) {
            tracing::info!(session_id = %session_id, "Session timed out");
            metrics::record_session_event("timeout");
        }
        Ok(false)
    }

    /// Log out a session and revoke its token.
    ///
    /// Returns whether this call changed the session's state.
    pub fn invalidate(&self, session_id: &str) -> ShieldResult<bool> {
        let now = self.clock.now_millis();
        let (token, changed) = {
            let mut session = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| ShieldError::not_found("session", session_id))?;
            let changed = session.mark_invalid(now, InvalidationReason::Logout);
            (session.access_token.clone(), changed)
        };

        self.insert_blacklist(&token, now);
        if changed {
            tracing::info!(session_id = %session_id, "Session invalidated");
            metrics::record_session_event("logout");
        }
        Ok(changed)
    }

    /// Invalidate every session of `user_id`; returns how many were affected.
    pub fn invalidate_all_for_user(&self, user_id: &str) -> usize {
        let now = self.clock.now_millis();
        let mut revoked = Vec::new();

        for mut session in self.sessions.iter_mut() {
            if session.user_id == user_id && session.mark_invalid(now, InvalidationReason::UserSweep) {
                revoked.push(session.access_token.clone());
            }
        }

        for token in &revoked {
            self.insert_blacklist(token, now);
        }

        tracing::warn!(user_id = %user_id, count = revoked.len(), "All sessions invalidated for user");
        metrics::record_session_event("user_sweep");
        revoked.len()
    }

    fn insert_blacklist(&self, token: &str, now: u64) -> bool {
        if self.blacklist.contains_key(token) {
            return false;
        }
        let entry = BlacklistEntry {
            revoked_at: now,
            expires_at: now.saturating_add(self.config.token_ttl_minutes.saturating_mul(MILLIS_PER_MINUTE)),
        };
        self.blacklist.insert(token.to_string(), entry).is_none()
    }

    /// Permanently revoke a token and invalidate the session that owns it.
    ///
    /// Idempotent; returns whether the token was newly blacklisted.
    pub fn blacklist_token(&self, token: &str) -> bool {
        let now = self.clock.now_millis();
        let added = self.insert_blacklist(token, now);

        let owner = self.tokens.get(token).map(|id| id.clone());
        if let Some(session_id) = owner {
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                session.mark_invalid(now, InvalidationReason::Blacklisted);
            }
        }

        if added {
            tracing::warn!("Access token blacklisted");
            metrics::record_session_event("blacklisted");
        }
        added
    }

    /// Revoke a credential, failing if it was already revoked.
    pub fn revoke_token(&self, token: &str) -> ShieldResult<()> {
        if self.blacklist_token(token) {
            Ok(())
        } else {
            Err(ShieldError::terminal("token", "<redacted>"))
        }
    }

    /// A token is valid only while its session is valid and it is not blacklisted.
    pub fn is_token_valid(&self, token: &str) -> bool {
        if self.is_blacklisted(token) {
            return false;
        }
        let Some(session_id) = self.tokens.get(token).map(|id| id.clone()) else {
            return false;
        };
        self.is_valid(&session_id)
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Drop naturally expired blacklist entries and reap long-dead sessions.
    pub fn cleanup_expired(&self) -> SessionCleanup {
        let now = self.clock.now_millis();
        let retention = self.config.retention_minutes.saturating_mul(MILLIS_PER_MINUTE);
        let timeout = self.timeout_millis();

        let before = self.blacklist.len();
        self.blacklist.retain(|_, entry| entry.expires_at > now);
        let blacklist_removed = before.saturating_sub(self.blacklist.len());

        let mut reaped = Vec::new();
        self.sessions.retain(|_, session| {
            let dead_since = if session.valid {
                session.last_activity.saturating_add(timeout)
            } else {
                session.invalidated_at.unwrap_or(session.last_activity)
            };
            let dead = !session.valid || now.saturating_sub(session.last_activity) >= timeout;
            let keep = !(dead && now.saturating_sub(dead_since) >= retention);
            if !keep {
                reaped.push((session.access_token.clone(), session.id.clone()));
            }
            keep
        });
        // A later session may have claimed the same token.
        for (token, session_id) in &reaped {
            self.tokens.remove_if(token, |_, owner| owner == session_id);
        }

        let report = SessionCleanup {
            blacklist_removed,
            sessions_reaped: reaped.len(),
        };
        tracing::debug!(
            blacklist_removed = report.blacklist_removed,
            sessions_reaped = report.sessions_reaped,
            "Session cleanup complete"
        );
        metrics::record_tracked("sessions", self.sessions.len());
        report
    }

    pub fn stats(&self) -> SessionStats {
        let now = self.clock.now_millis();
        SessionStats {
            total_sessions: self.sessions.len(),
            active_sessions: self.sessions.iter().filter(|s| self.evaluate(s, now)).count(),
            blacklisted_tokens: self.blacklist.len(),
        }
    }

    /// When a blacklisted token was revoked, if it still is.
    pub fn revoked_at(&self, token: &str) -> Option<u64> {
        self.blacklist.get(token).map(|e| e.revoked_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use std::time::Duration;

    fn registry(timeout_minutes: u64) -> (SessionRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let config = SessionConfig {
            timeout_minutes,
            ..Default::default()
        };
        (SessionRegistry::new(config, clock.clone()).unwrap(), clock)
    }

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_create_and_validate() {
        let (registry, _clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "10.0.0.1");
        assert!(session.valid);
        assert_eq!(session.created_at, session.last_activity);
        assert!(registry.is_valid(&session.id));
        assert!(registry.is_token_valid("tok-1"));
        assert!(!registry.is_valid("missing"));
    }

    #[test]
    fn test_touch_keeps_session_alive() {
        let (registry, clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "ip");
        for _ in 0..100 {
            clock.advance(MINUTE * 59);
            assert!(registry.touch(&session.id).unwrap());
        }
        assert!(registry.is_valid(&session.id));
    }

    #[test]
    fn test_untouched_session_times_out() {
        let (registry, clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "ip");
        clock.advance(MINUTE * 61);

        assert!(!registry.is_valid(&session.id));
        // is_valid never mutates.
        assert!(registry.get_session(&session.id).unwrap().valid);

        assert!(!registry.touch(&session.id).unwrap());
        let stored = registry.get_session(&session.id).unwrap();
        assert!(!stored.valid);
        assert_eq!(stored.invalidation_reason, Some(InvalidationReason::Timeout));
    }

    #[test]
    fn test_timeout_boundary_is_inclusive() {
        let (registry, clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "ip");
        clock.advance(MINUTE * 60);
        assert!(!registry.is_valid(&session.id));
    }

    #[test]
    fn test_invalidate_blacklists_token() {
        let (registry, _clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "ip");

        assert!(registry.invalidate(&session.id).unwrap());
        assert!(!registry.is_valid(&session.id));
        assert!(!registry.is_token_valid("tok-1"));
        assert!(registry.revoked_at("tok-1").is_some());

        assert!(!registry.invalidate(&session.id).unwrap());
        assert!(matches!(
            registry.invalidate("missing"),
            Err(ShieldError::NotFound { .. })
        ));
    }

    #[test]
    fn test_touch_unknown_session() {
        let (registry, _clock) = registry(60);
        assert!(registry.touch("missing").is_err());
    }

    #[test]
    fn test_touch_after_invalidate_does_not_revive() {
        let (registry, clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "ip");
        registry.invalidate(&session.id).unwrap();
        clock.advance(MINUTE);
        assert!(!registry.touch(&session.id).unwrap());
        assert_eq!(registry.get_session(&session.id).unwrap().last_activity, 1_000_000);
    }

    #[test]
    fn test_invalidate_all_for_user_is_scoped() {
        let (registry, _clock) = registry(60);
        let mine: Vec<_> = (0..3)
            .map(|i| registry.create_session("u1", &format!("tok-{}", i), "agent", "ip"))
            .collect();
        let other = registry.create_session("u2", "tok-other", "agent", "ip");

        assert_eq!(registry.invalidate_all_for_user("u1"), 3);
        for session in &mine {
            assert!(!registry.is_valid(&session.id));
        }
        assert!(registry.is_valid(&other.id));
        assert_eq!(registry.invalidate_all_for_user("u1"), 0);
    }

    #[test]
    fn test_blacklist_flips_session_immediately() {
        let (registry, clock) = registry(60);
        let session = registry.create_session("u1", "tok-1", "agent", "ip");
        clock.advance(MINUTE);

        assert!(registry.blacklist_token("tok-1"));
        assert!(!registry.is_token_valid("tok-1"));
        assert!(!registry.is_valid(&session.id));
        let stored = registry.get_session(&session.id).unwrap();
        assert_eq!(stored.invalidation_reason, Some(InvalidationReason::Blacklisted));

        assert!(!registry.blacklist_token("tok-1"));
    }

    #[test]
    fn test_revoke_twice_is_terminal() {
        let (registry, _clock) = registry(60);
        registry.create_session("u1", "tok-1", "agent", "ip");
        registry.revoke_token("tok-1").unwrap();
        assert!(matches!(
            registry.revoke_token("tok-1"),
            Err(ShieldError::AlreadyInTerminalState { .. })
        ));
    }

    #[test]
    fn test_unknown_token_is_not_valid() {
        let (registry, _clock) = registry(60);
        assert!(!registry.is_token_valid("never-issued"));
    }

    #[test]
    fn test_cleanup_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let config = SessionConfig {
            timeout_minutes: 10,
            token_ttl_minutes: 30,
            retention_minutes: 20,
        };
        let registry = SessionRegistry::new(config, clock.clone()).unwrap();
        let dead = registry.create_session("u1", "tok-dead", "agent", "ip");
        let live = registry.create_session("u1", "tok-live", "agent", "ip");
        registry.invalidate(&dead.id).unwrap();

        clock.advance(MINUTE * 9);
        registry.touch(&live.id).unwrap();
        clock.advance(MINUTE * 9);
        registry.touch(&live.id).unwrap();
        clock.advance(MINUTE * 9);
        registry.touch(&live.id).unwrap();

        // t = 27 min: dead session invalid for 27 >= 20 minutes.
        let report = registry.cleanup_expired();
        assert_eq!(report.sessions_reaped, 1);
        assert_eq!(report.blacklist_removed, 0);
        assert!(registry.get_session(&dead.id).is_err());
        assert!(!registry.is_token_valid("tok-dead"));
        assert!(registry.is_valid(&live.id));

        clock.advance(MINUTE * 5);
        assert_eq!(registry.cleanup_expired().blacklist_removed, 1);
        assert!(!registry.is_token_valid("tok-dead"));
    }

    #[test]
    fn test_cleanup_keeps_token_claimed_by_newer_session() {
        let clock = Arc::new(ManualClock::new(0));
        let config = SessionConfig {
            timeout_minutes: 10,
            token_ttl_minutes: 30,
            retention_minutes: 20,
        };
        let registry = SessionRegistry::new(config, clock.clone()).unwrap();
        let stale = registry.create_session("u1", "tok-shared", "agent", "ip");

        clock.advance(MINUTE * 11);
        assert!(!registry.is_valid(&stale.id));
        let fresh = registry.create_session("u1", "tok-shared", "agent", "ip");

        clock.advance(MINUTE * 9);
        registry.touch(&fresh.id).unwrap();
        clock.advance(MINUTE * 9);
        registry.touch(&fresh.id).unwrap();
        clock.advance(MINUTE);

        // t = 30 min: the stale session has been dead for 20 minutes.
        assert_eq!(registry.cleanup_expired().sessions_reaped, 1);
        assert!(registry.get_session(&stale.id).is_err());
        assert!(registry.is_token_valid("tok-shared"));
    }

    #[test]
    fn test_stats() {
        let (registry, _clock) = registry(60);
        let a = registry.create_session("u1", "a", "agent", "ip");
        registry.create_session("u2", "b", "agent", "ip");
        registry.invalidate(&a.id).unwrap();

        let stats = registry.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.active_sessions, 1);
        assert_eq!(stats.blacklisted_tokens, 1);
        assert_eq!(registry.sessions_for_user("u1").len(), 1);
    }
}
