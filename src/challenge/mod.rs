//! The acquisition state machine that drives one attempt through the
//! challenge wall, shared by the auth and join specializations.

mod auth;
mod join;
mod stages;

pub use auth::{AuthChallenge, ReeseCookie};
pub use join::{CionResponse, JoinChallenge};
pub use stages::{ReloadCheck, StageRunner};

use std::collections::HashMap;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};

use crate::browser::BrowserError;
use crate::proxy::ProxyRecord;

/// Classified outcome of one acquisition attempt.
///
/// Stages return these as tagged variants so the attempt boundary can branch
/// on the classification instead of on error types thrown through it.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// The challenge or page logic rejected this attempt. The proxy is not
    /// necessarily bad; its health is never touched for this class.
    #[error("{0}")]
    Login(String),

    /// The proxy itself is unreachable or dead. Penalized per mode policy
    /// and the browser session is restarted.
    #[error("{0}")]
    Proxy(String),

    /// The browser session could not start; retried on the next attempt.
    #[error("browser session failed to start: {0}")]
    SessionStart(String),

    /// Anything the stages could not classify. Fail-safe: assume corrupted
    /// browser state and restart.
    #[error(transparent)]
    Driver(#[from] BrowserError),
}

/// What a `Proxy`-classified failure does to the implicated record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyPenalty {
    /// Cooldown; the proxy re-enters rotation later (auth mode)
    RateLimit,
    /// Permanent exclusion (join mode)
    Invalidate,
}

impl ProxyPenalty {
    pub fn apply(&self, proxy: &ProxyRecord) {
        match self {
            ProxyPenalty::RateLimit => proxy.rate_limited(),
            ProxyPenalty::Invalidate => proxy.invalidate(),
        }
    }
}

/// Per-session state owned by the lease holder.
///
/// Reset deterministically on browser restart; nothing about the session is
/// carried implicitly across attempts.
#[derive(Debug)]
pub struct SessionState {
    started_once: bool,
    /// True until the first attempt on this browser session completes
    pub first_run: bool,
    /// A cookie purge from the previous attempt has not been confirmed yet
    pub purge_pending: bool,
    /// The browser must be stopped and relaunched before the next attempt
    pub needs_restart: bool,
    /// Cookies replayed into the fresh tab before navigation (auth mode)
    pub last_cookies: Option<HashMap<String, String>>,
    /// Incremented on every failed attempt, reset on success
    pub consecutive_failures: u32,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            started_once: false,
            first_run: true,
            purge_pending: false,
            needs_restart: false,
            last_cookies: None,
            consecutive_failures: 0,
        }
    }

    /// Called when the browser is relaunched.
    pub fn reset_for_restart(&mut self) {
        self.first_run = true;
        self.purge_pending = false;
        self.needs_restart = false;
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_once = true;
    }

    pub(crate) fn was_started(&self) -> bool {
        self.started_once
    }
}

/// Mutual-exclusion token over the shared browser session.
///
/// An acquisition attempt holds the lease from session start to artifact
/// extraction. Handlers that must reject rather than queue use
/// [`SessionLease::try_acquire`]; everyone else blocks.
pub struct SessionLease {
    inner: Mutex<SessionState>,
}

impl SessionLease {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SessionState::new()),
        }
    }

    pub async fn acquire(&self) -> MutexGuard<'_, SessionState> {
        self.inner.lock().await
    }

    pub fn try_acquire(&self) -> Option<MutexGuard<'_, SessionState>> {
        self.inner.try_lock().ok()
    }
}

impl Default for SessionLease {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lease_try_acquire_rejects_while_held() {
        let lease = SessionLease::new();
        let guard = lease.acquire().await;
        assert!(lease.try_acquire().is_none());
        drop(guard);
        assert!(lease.try_acquire().is_some());
    }

    #[test]
    fn test_state_reset_on_restart() {
        let mut state = SessionState::new();
        state.first_run = false;
        state.purge_pending = true;
        state.needs_restart = true;
        state.consecutive_failures = 3;

        state.reset_for_restart();

        assert!(state.first_run);
        assert!(!state.purge_pending);
        assert!(!state.needs_restart);
        // the counter survives restarts; it tracks the owner, not the browser
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn test_penalty_application() {
        let proxy = ProxyRecord::new("http", "10.0.0.1", 8080);
        ProxyPenalty::RateLimit.apply(&proxy);
        assert!(!proxy.is_eligible());
        assert!(!proxy.is_invalidated());

        let proxy = ProxyRecord::new("http", "10.0.0.2", 8080);
        ProxyPenalty::Invalidate.apply(&proxy);
        assert!(proxy.is_invalidated());
    }
}
