//! Single-flight broker for the most recent reese-cookie bundle.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::challenge::{AcquireError, AuthChallenge, ReeseCookie, SessionLease};
use crate::proxy::{acquire_backoff, ProxyDispenser, ProxyDistributor};

/// Give up after this many failed acquisition rounds; the HTTP caller's own
/// deadline usually fires first.
const MAX_COOKIE_ATTEMPTS: u32 = 8;

/// Caches the most recent cookie bundle and serializes acquisition attempts.
///
/// Concurrent callers share one in-flight acquisition: the first caller runs
/// it, later callers block on the flight token and then hit the refreshed
/// cache.
pub struct CookieBroker {
    challenge: Arc<AuthChallenge>,
    dispenser: Arc<ProxyDispenser>,
    distributor: Arc<ProxyDistributor>,
    lease: SessionLease,
    cached: Mutex<Option<Arc<ReeseCookie>>>,
    flight: Mutex<()>,
}

impl CookieBroker {
    pub fn new(
        challenge: Arc<AuthChallenge>,
        dispenser: Arc<ProxyDispenser>,
        distributor: Arc<ProxyDistributor>,
    ) -> Self {
        Self {
            challenge,
            dispenser,
            distributor,
            lease: SessionLease::new(),
            cached: Mutex::new(None),
            flight: Mutex::new(()),
        }
    }

    /// Return the cached bundle, or acquire a fresh one.
    pub async fn get_cookie(&self) -> Result<Arc<ReeseCookie>, AcquireError> {
        if let Some(cookie) = self.cached.lock().await.clone() {
            return Ok(cookie);
        }

        let _flight = self.flight.lock().await;

        // someone else may have refreshed the cache while we waited
        if let Some(cookie) = self.cached.lock().await.clone() {
            return Ok(cookie);
        }

        for attempt in 1..=MAX_COOKIE_ATTEMPTS {
            let proxy = match self.dispenser.get_candidate_proxy() {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!("{}, backing off before retry", e);
                    sleep(acquire_backoff(attempt)).await;
                    continue;
                }
            };

            let proxy_changed = self.distributor.request_rotation(proxy.clone());

            let mut state = self.lease.acquire().await;
            match self.challenge.run(&mut state, &proxy, proxy_changed).await {
                Ok(cookie) => {
                    drop(state);
                    info!("Fresh reese cookie acquired via {}", proxy.url());
                    let cookie = Arc::new(cookie);
                    *self.cached.lock().await = Some(cookie.clone());
                    return Ok(cookie);
                }
                Err(e) => {
                    warn!("Cookie acquisition attempt {} failed: {}", attempt, e);
                }
            }
        }

        Err(AcquireError::Login(
            "exhausted cookie acquisition attempts".to_string(),
        ))
    }

    /// Drop the cached bundle if it is the one the caller found stale.
    pub async fn invalidate(&self, stale: &Arc<ReeseCookie>) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|c| Arc::ptr_eq(c, stale)) {
            *cached = None;
        }
    }
}
