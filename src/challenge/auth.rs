//! Auth specialization: drive one attempt to obtain a fresh reese-cookie
//! bundle through the challenge wall.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use super::{AcquireError, ProxyPenalty, ReloadCheck, SessionState, StageRunner};
use crate::browser::BrowserDriver;
use crate::proxy::ProxyRecord;
use crate::ptc::{login_url, ACCESS_URL, JS_CHALLENGE_TIMEOUT, LOGIN_FORM_MARKER, PAGE_LOAD_TIMEOUT};
use crate::signal::SignalChannel;

/// The session cookie bundle produced after passing the challenge wall,
/// tagged with the exact proxy that obtained it. Consumers must replay the
/// cookies through the same proxy.
#[derive(Debug, Clone)]
pub struct ReeseCookie {
    pub cookies: HashMap<String, String>,
    pub proxy: Arc<ProxyRecord>,
}

/// One reese-cookie acquisition attempt over the shared browser session.
pub struct AuthChallenge {
    runner: StageRunner,
}

impl AuthChallenge {
    pub fn new(driver: Arc<dyn BrowserDriver>, signal: Arc<dyn SignalChannel>) -> Self {
        Self {
            runner: StageRunner::new(driver, signal),
        }
    }

    /// Run one attempt. The caller holds the session lease; classification
    /// effects (proxy health, restart flags, failure counter) are applied
    /// before returning.
    pub async fn run(
        &self,
        state: &mut SessionState,
        proxy: &Arc<ProxyRecord>,
        proxy_changed: bool,
    ) -> Result<ReeseCookie, AcquireError> {
        let result = self.attempt(state, proxy, proxy_changed).await;
        self.settle(state, proxy, &result).await;
        result
    }

    async fn attempt(
        &self,
        state: &mut SessionState,
        proxy: &Arc<ProxyRecord>,
        proxy_changed: bool,
    ) -> Result<ReeseCookie, AcquireError> {
        self.runner.start_session(state).await?;
        let driver = self.runner.driver().clone();

        driver.new_page().await?;
        driver.watch_responses(ACCESS_URL).await?;

        if proxy_changed {
            self.runner.propagate_proxy(proxy).await?;
        }
        self.runner.await_cookie_purge(state).await;

        if let Some(cookies) = state.last_cookies.clone() {
            driver.set_cookies(&cookies, ACCESS_URL).await?;
        }

        info!("Opening login page");
        driver
            .navigate(&login_url(), PAGE_LOAD_TIMEOUT)
            .await
            .map_err(|e| StageRunner::classify_navigation(e, proxy))?;

        let html = tokio::time::timeout(PAGE_LOAD_TIMEOUT, driver.get_content())
            .await
            .map_err(|_| {
                AcquireError::Proxy(format!("Page timed out (proxy: {})", proxy.url()))
            })??;

        self.runner.check_error_page(&html, proxy)?;
        self.runner.classify_imperva(&html, proxy)?;
        self.runner.await_js_challenge(JS_CHALLENGE_TIMEOUT).await?;
        self.runner.confirm_reload(login_form_rendered).await?;

        info!("Getting cookies from browser");
        let cookies = driver.get_cookies().await?;

        Ok(ReeseCookie {
            cookies,
            proxy: proxy.clone(),
        })
    }

    async fn settle(
        &self,
        state: &mut SessionState,
        proxy: &Arc<ProxyRecord>,
        result: &Result<ReeseCookie, AcquireError>,
    ) {
        match result {
            Ok(cookie) => {
                state.consecutive_failures = 0;
                state.purge_pending = true;
                state.last_cookies = Some(cookie.cookies.clone());
            }
            Err(AcquireError::Login(msg)) => {
                error!("{} while getting cookie", msg);
                state.consecutive_failures += 1;
                state.purge_pending = true;
            }
            Err(AcquireError::Proxy(msg)) => {
                error!("{} while getting cookie", msg);
                ProxyPenalty::RateLimit.apply(proxy);
                state.consecutive_failures += 1;
                state.needs_restart = true;
                let _ = self.runner.driver().stop().await;
            }
            Err(AcquireError::SessionStart(msg)) => {
                error!("{}, will retry next attempt", msg);
                state.needs_restart = true;
            }
            Err(AcquireError::Driver(e)) => {
                error!(
                    "Browser error while getting cookie, session will be restarted: {}",
                    e
                );
                state.consecutive_failures += 1;
                state.needs_restart = true;
                let _ = self.runner.driver().stop().await;
            }
        }
    }
}

fn login_form_rendered(html: &str) -> ReloadCheck {
    if html.to_lowercase().contains(LOGIN_FORM_MARKER) {
        ReloadCheck::Ready
    } else {
        ReloadCheck::NotYet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserError;
    use crate::challenge::SessionLease;
    use crate::testkit::{MockDriver, MockSignal};

    const CHALLENGE_PAGE: &str = "<html><body>Error code 15, checking your browser</body></html>";
    const LOGIN_PAGE: &str = "<html><body><form>Log in to continue</form></body></html>";

    fn challenge_with(driver: Arc<MockDriver>) -> AuthChallenge {
        AuthChallenge::new(driver, Arc::new(MockSignal::default()))
    }

    fn proxy() -> Arc<ProxyRecord> {
        Arc::new(ProxyRecord::new("http", "10.0.0.1", 8080))
    }

    #[tokio::test]
    async fn test_successful_acquisition() {
        let driver = Arc::new(
            MockDriver::default()
                .with_contents(vec![CHALLENGE_PAGE, LOGIN_PAGE])
                .with_cookie("reese84", "token-value"),
        );
        driver.complete_challenge(true);

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let cookie = challenge.run(&mut state, &proxy, false).await.unwrap();

        assert_eq!(cookie.cookies.get("reese84").unwrap(), "token-value");
        assert!(Arc::ptr_eq(&cookie.proxy, &proxy));
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.purge_pending);
        assert!(state.last_cookies.is_some());
    }

    #[tokio::test]
    async fn test_concrete_imperva_code_is_login_failure() {
        let driver = Arc::new(
            MockDriver::default()
                .with_contents(vec!["<html>Error code 16, access denied</html>"]),
        );

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let err = challenge.run(&mut state, &proxy, false).await.unwrap_err();

        assert!(matches!(err, AcquireError::Login(_)));
        // a login classification never touches proxy health
        assert!(proxy.is_eligible());
        assert!(!proxy.is_invalidated());
        assert_eq!(state.consecutive_failures, 1);
        // session is kept alive for reuse
        assert!(!state.needs_restart);
        assert_eq!(driver.stop_calls(), 0);
    }

    #[tokio::test]
    async fn test_navigation_timeout_penalizes_proxy_and_restarts() {
        let driver = Arc::new(MockDriver::default());
        driver.fail_navigate(BrowserError::Timeout("Navigation timeout".into()));

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let err = challenge.run(&mut state, &proxy, false).await.unwrap_err();

        assert!(matches!(err, AcquireError::Proxy(_)));
        assert!(!proxy.is_eligible());
        assert!(!proxy.is_invalidated());
        assert!(state.needs_restart);
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(driver.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_net_error_page_is_proxy_failure() {
        let driver = Arc::new(
            MockDriver::default()
                .with_contents(vec!["<body class=\"neterror\">site unreachable</body>"]),
        );

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let err = challenge.run(&mut state, &proxy, false).await.unwrap_err();

        assert!(matches!(err, AcquireError::Proxy(_)));
        assert!(!proxy.is_eligible());
    }

    #[tokio::test]
    async fn test_js_challenge_timeout_is_login_failure() {
        let driver = Arc::new(MockDriver::default().with_contents(vec![CHALLENGE_PAGE]));
        driver.complete_challenge(false);

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let err = challenge.run(&mut state, &proxy, false).await.unwrap_err();

        match err {
            AcquireError::Login(msg) => assert!(msg.contains("Timeout on JS challenge")),
            other => panic!("expected login failure, got {other:?}"),
        }
        assert!(proxy.is_eligible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reload_loop_bounded_at_ten_iterations() {
        // first content is the accepted challenge page, every reload probe
        // then sees a half-rendered page with no marker and no code
        let driver = Arc::new(
            MockDriver::default().with_contents(vec![CHALLENGE_PAGE, "<html>still loading"]),
        );
        driver.complete_challenge(true);

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let err = challenge.run(&mut state, &proxy, false).await.unwrap_err();

        match err {
            AcquireError::Login(msg) => {
                assert!(msg.contains("Timed out while waiting for reload to finish"))
            }
            other => panic!("expected login failure, got {other:?}"),
        }
        // one pre-reload fetch plus exactly ten loop probes
        assert_eq!(driver.content_calls(), 11);
    }

    #[tokio::test]
    async fn test_session_start_failure_retries_next_attempt() {
        let driver = Arc::new(MockDriver::default());
        driver.fail_start("chrome exploded");

        let challenge = challenge_with(driver.clone());
        let lease = SessionLease::new();
        let mut state = lease.acquire().await;

        let proxy = proxy();
        let err = challenge.run(&mut state, &proxy, false).await.unwrap_err();

        assert!(matches!(err, AcquireError::SessionStart(_)));
        assert!(state.needs_restart);
        assert!(proxy.is_eligible());
    }
}
