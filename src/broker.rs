//! Desktop session broker.
//!
//! Issues short-lived session tokens, enforces the concurrent-session cap,
//! and owns the lifecycle of desktop sessions including the cancellation
//! handle of an attached stream. One lock guards both stores; the purge
//! task takes the same lock on its 10 s cadence.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Requested TTLs are clamped into this range.
const MIN_TTL: Duration = Duration::from_secs(60);
const MAX_TTL: Duration = Duration::from_secs(3600);

/// Cadence of the expired-session/token sweep. With the 60 s TTL floor an
/// expiry is observed at most this late.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(10);

/// Random bytes behind each opaque token string.
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("caller is not allowed")]
    CallerNotAllowed,

    #[error("session_limit")]
    SessionLimit,

    #[error("unknown token")]
    UnknownToken,

    #[error("token expired")]
    ExpiredToken,

    #[error("unknown session")]
    UnknownSession,
}

/// An issued bearer token.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub token: String,
    pub caller_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// An active desktop session.
#[derive(Debug, Clone)]
pub struct DesktopSession {
    pub id: Uuid,
    pub caller_id: String,
    pub started_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Cancelling this tears down the attached stream, when one exists.
    stream_cancel: Option<CancellationToken>,
    /// Token issued with the session, revoked with it.
    token: String,
}

impl DesktopSession {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Default)]
struct BrokerState {
    tokens: HashMap<String, SessionToken>,
    sessions: HashMap<Uuid, DesktopSession>,
}

pub struct SessionBroker {
    state: Mutex<BrokerState>,
    allowlist: Vec<String>,
    allow_empty_allowlist: bool,
    max_sessions: usize,
}

fn clamp_ttl(requested: Duration) -> Duration {
    requested.clamp(MIN_TTL, MAX_TTL)
}

fn random_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

impl SessionBroker {
    pub fn new(
        allowlist: Vec<String>,
        allow_empty_allowlist: bool,
        max_sessions: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
            allowlist,
            allow_empty_allowlist,
            max_sessions: max_sessions.max(1),
        })
    }

    /// Allowlist check. An empty list denies everyone unless
    /// `allow_empty_allowlist` opts into the permissive behavior.
    pub fn is_caller_allowed(&self, caller_id: &str) -> bool {
        if self.allowlist.is_empty() {
            return self.allow_empty_allowlist;
        }
        self.allowlist.iter().any(|entry| entry == caller_id)
    }

    /// Create a session plus its bearer token, enforcing the caller
    /// allowlist and the concurrent-session cap.
    pub fn start_session(
        &self,
        caller_id: &str,
        requested_ttl: Duration,
    ) -> Result<(DesktopSession, SessionToken), BrokerError> {
        if !self.is_caller_allowed(caller_id) {
            return Err(BrokerError::CallerNotAllowed);
        }

        let ttl = clamp_ttl(requested_ttl);
        let now = Utc::now();
        let expires_at = now
            + chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::seconds(60));

        let mut state = self.state.lock().unwrap();

        let active = state
            .sessions
            .values()
            .filter(|session| !session.expired(now))
            .count();
        if active >= self.max_sessions {
            return Err(BrokerError::SessionLimit);
        }

        let token = SessionToken {
            token: random_token(),
            caller_id: caller_id.to_string(),
            issued_at: now,
            expires_at,
        };
        let session = DesktopSession {
            id: Uuid::new_v4(),
            caller_id: caller_id.to_string(),
            started_at: now,
            expires_at,
            stream_cancel: None,
            token: token.token.clone(),
        };

        state.tokens.insert(token.token.clone(), token.clone());
        state.sessions.insert(session.id, session.clone());

        info!(
            session_id = %session.id,
            caller_id,
            expires_at = %expires_at,
            "desktop session started"
        );
        Ok((session, token))
    }

    /// Mint a standalone bearer token for a caller, e.g. to let an
    /// existing session reconnect its stream. Purged on expiry like any
    /// other token.
    pub fn issue_token(
        &self,
        caller_id: &str,
        requested_ttl: Duration,
    ) -> Result<SessionToken, BrokerError> {
        if !self.is_caller_allowed(caller_id) {
            return Err(BrokerError::CallerNotAllowed);
        }

        let now = Utc::now();
        let ttl = clamp_ttl(requested_ttl);
        let token = SessionToken {
            token: random_token(),
            caller_id: caller_id.to_string(),
            issued_at: now,
            expires_at: now
                + chrono::TimeDelta::from_std(ttl).unwrap_or(chrono::TimeDelta::seconds(60)),
        };

        self.state
            .lock()
            .unwrap()
            .tokens
            .insert(token.token.clone(), token.clone());
        Ok(token)
    }

    /// Look up a token; fails on unknown or expired, even when the
    /// expired entry is still indexed.
    pub fn validate_token(&self, token: &str) -> Result<SessionToken, BrokerError> {
        let state = self.state.lock().unwrap();
        let found = state.tokens.get(token).ok_or(BrokerError::UnknownToken)?;
        if found.expires_at <= Utc::now() {
            return Err(BrokerError::ExpiredToken);
        }
        Ok(found.clone())
    }

    pub fn get_session(&self, id: Uuid) -> Option<DesktopSession> {
        self.state.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn active_session_count(&self) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .unwrap()
            .sessions
            .values()
            .filter(|session| !session.expired(now))
            .count()
    }

    /// Attach a stream's cancellation source so `end_session` can tear the
    /// stream down immediately.
    pub fn attach_stream(
        &self,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .get_mut(&session_id)
            .ok_or(BrokerError::UnknownSession)?;
        if let Some(previous) = session.stream_cancel.replace(cancel) {
            // A reconnect replaced the old stream; make sure it dies.
            previous.cancel();
        }
        Ok(())
    }

    pub fn detach_stream(&self, session_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.stream_cancel = None;
        }
    }

    /// End a session: drop it, revoke its token, cancel any attached
    /// stream. Idempotent.
    pub fn end_session(&self, session_id: Uuid) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let removed = state.sessions.remove(&session_id);
            if let Some(session) = &removed {
                state.tokens.remove(&session.token);
            }
            removed
        };

        match removed {
            Some(session) => {
                if let Some(cancel) = session.stream_cancel {
                    cancel.cancel();
                }
                info!(session_id = %session_id, "desktop session ended");
            }
            None => debug!(session_id = %session_id, "end for unknown session ignored"),
        }
    }

    /// Drop expired sessions and tokens, cancelling any attached streams.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            let expired: Vec<Uuid> = state
                .sessions
                .values()
                .filter(|session| session.expired(now))
                .map(|session| session.id)
                .collect();
            for id in expired {
                if let Some(session) = state.sessions.remove(&id) {
                    state.tokens.remove(&session.token);
                    if let Some(cancel) = session.stream_cancel {
                        cancelled.push((id, cancel));
                    }
                }
            }
            state.tokens.retain(|_, token| token.expires_at > now);
        }

        for (id, cancel) in cancelled {
            warn!(session_id = %id, "session expired with live stream, cancelling");
            cancel.cancel();
        }
    }

    /// Periodic purge; runs until `shutdown` fires.
    pub async fn run_purge_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => self.purge_expired(),
                _ = shutdown.cancelled() => break,
            }
        }
    }

    #[cfg(test)]
    fn force_expire(&self, session_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        let past = Utc::now() - chrono::TimeDelta::seconds(5);
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.expires_at = past;
            let token = session.token.clone();
            if let Some(token) = state.tokens.get_mut(&token) {
                token.expires_at = past;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> Arc<SessionBroker> {
        SessionBroker::new(vec!["ha1".to_string()], false, 1)
    }

    #[test]
    fn ttl_requests_are_clamped() {
        let broker = broker();

        let (session, _) = broker.start_session("ha1", Duration::from_secs(10)).unwrap();
        let lifetime = (session.expires_at - session.started_at).num_seconds();
        assert_eq!(lifetime, 60);
        broker.end_session(session.id);

        let (session, _) = broker
            .start_session("ha1", Duration::from_secs(7200))
            .unwrap();
        let lifetime = (session.expires_at - session.started_at).num_seconds();
        assert_eq!(lifetime, 3600);
    }

    #[test]
    fn empty_allowlist_denies_unless_configured() {
        let deny = SessionBroker::new(vec![], false, 1);
        assert!(!deny.is_caller_allowed("anyone"));
        assert_eq!(
            deny.start_session("anyone", MIN_TTL).unwrap_err(),
            BrokerError::CallerNotAllowed
        );

        let allow = SessionBroker::new(vec![], true, 1);
        assert!(allow.is_caller_allowed("anyone"));
    }

    #[test]
    fn allowlist_membership_is_exact() {
        let broker = broker();
        assert!(broker.is_caller_allowed("ha1"));
        assert!(!broker.is_caller_allowed("ha2"));
    }

    #[test]
    fn session_cap_is_enforced_and_frees_on_end() {
        let broker = broker();
        let (first, _) = broker.start_session("ha1", MIN_TTL).unwrap();
        assert_eq!(
            broker.start_session("ha1", MIN_TTL).unwrap_err(),
            BrokerError::SessionLimit
        );

        broker.end_session(first.id);
        assert!(broker.start_session("ha1", MIN_TTL).is_ok());
    }

    #[test]
    fn tokens_validate_until_expiry() {
        let broker = broker();
        let (session, token) = broker.start_session("ha1", MIN_TTL).unwrap();

        let validated = broker.validate_token(&token.token).unwrap();
        assert_eq!(validated.caller_id, "ha1");

        assert_eq!(
            broker.validate_token("not-a-token").unwrap_err(),
            BrokerError::UnknownToken
        );

        // Expired tokens fail validation even while still indexed.
        broker.force_expire(session.id);
        assert_eq!(
            broker.validate_token(&token.token).unwrap_err(),
            BrokerError::ExpiredToken
        );
    }

    #[test]
    fn tokens_are_high_entropy_and_unique() {
        let first = random_token();
        let second = random_token();
        assert_ne!(first, second);
        // 32 bytes of OS randomness, base64url without padding.
        assert_eq!(first.len(), 43);
    }

    #[test]
    fn standalone_tokens_validate_and_honor_the_allowlist() {
        let broker = broker();
        assert_eq!(
            broker.issue_token("stranger", MIN_TTL).unwrap_err(),
            BrokerError::CallerNotAllowed
        );

        let token = broker.issue_token("ha1", Duration::from_secs(7200)).unwrap();
        let lifetime = (token.expires_at - token.issued_at).num_seconds();
        assert_eq!(lifetime, 3600);
        assert!(broker.validate_token(&token.token).is_ok());
    }

    #[test]
    fn end_session_cancels_attached_stream_and_is_idempotent() {
        let broker = broker();
        let (session, _) = broker.start_session("ha1", MIN_TTL).unwrap();

        let cancel = CancellationToken::new();
        broker.attach_stream(session.id, cancel.clone()).unwrap();
        assert!(!cancel.is_cancelled());

        broker.end_session(session.id);
        assert!(cancel.is_cancelled());
        assert_eq!(broker.active_session_count(), 0);

        // Second end observes the same state.
        broker.end_session(session.id);
        assert_eq!(broker.active_session_count(), 0);
    }

    #[test]
    fn reattaching_a_stream_cancels_the_previous_one() {
        let broker = broker();
        let (session, _) = broker.start_session("ha1", MIN_TTL).unwrap();

        let first = CancellationToken::new();
        let second = CancellationToken::new();
        broker.attach_stream(session.id, first.clone()).unwrap();
        broker.attach_stream(session.id, second.clone()).unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn purge_drops_expired_sessions_and_cancels_streams() {
        let broker = broker();
        let (session, token) = broker.start_session("ha1", MIN_TTL).unwrap();
        let cancel = CancellationToken::new();
        broker.attach_stream(session.id, cancel.clone()).unwrap();

        broker.force_expire(session.id);
        broker.purge_expired();

        assert!(cancel.is_cancelled());
        assert!(broker.get_session(session.id).is_none());
        assert_eq!(
            broker.validate_token(&token.token).unwrap_err(),
            BrokerError::UnknownToken
        );
        // The cap is free again.
        assert!(broker.start_session("ha1", MIN_TTL).is_ok());
    }
}
