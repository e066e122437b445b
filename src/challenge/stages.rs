//! Shared stage helpers used by both acquisition specializations.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info};

use super::{AcquireError, SessionState};
use crate::browser::{BrowserDriver, BrowserError};
use crate::proxy::ProxyRecord;
use crate::ptc::{
    imperva_code_passable, imperva_error_code, IMPERVA_UNKNOWN, NET_ERROR_MARKER,
    PROPAGATION_TIMEOUT, RELOAD_ATTEMPTS, RELOAD_POLL,
};
use crate::signal::{SignalChannel, FINISH_COOKIE_PURGE, FINISH_PROXY};

/// Result of one readiness probe in the reload-confirmation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadCheck {
    /// The target page actually rendered
    Ready,
    /// The wall rendered its own error frame; stop probing
    ErrorPage,
    /// Neither marker present yet
    NotYet,
}

/// Drives the fixed stage sequence against the browser driver and the
/// signal bridge.
pub struct StageRunner {
    driver: Arc<dyn BrowserDriver>,
    signal: Arc<dyn SignalChannel>,
}

impl StageRunner {
    pub fn new(driver: Arc<dyn BrowserDriver>, signal: Arc<dyn SignalChannel>) -> Self {
        Self { driver, signal }
    }

    pub fn driver(&self) -> &Arc<dyn BrowserDriver> {
        &self.driver
    }

    /// Stage 1: start or reuse the browser session. A flagged restart stops
    /// the browser and resets the session state before relaunching.
    pub async fn start_session(&self, state: &mut SessionState) -> Result<(), AcquireError> {
        if state.needs_restart && state.was_started() {
            info!("Restarting browser session");
            let _ = self.driver.stop().await;
            state.reset_for_restart();
        }

        self.driver
            .start()
            .await
            .map_err(|e| AcquireError::SessionStart(e.to_string()))?;

        state.mark_started();
        state.needs_restart = false;
        Ok(())
    }

    /// Stage 2: push the rotated proxy into the live session and wait
    /// briefly for the extension to confirm. Expiry is non-fatal.
    pub async fn propagate_proxy(&self, proxy: &ProxyRecord) -> Result<(), AcquireError> {
        self.driver.set_proxy(proxy).await?;

        if !self.signal.await_event(FINISH_PROXY, PROPAGATION_TIMEOUT).await {
            info!("Didn't get confirmation that proxy changed, continuing anyway");
        }
        Ok(())
    }

    /// Stage 3: wait for an outstanding cookie-purge confirmation. Expiry is
    /// non-fatal. Clears the first-run and purge flags.
    pub async fn await_cookie_purge(&self, state: &mut SessionState) {
        if !state.first_run && state.purge_pending {
            if !self
                .signal
                .await_event(FINISH_COOKIE_PURGE, PROPAGATION_TIMEOUT)
                .await
            {
                info!("Didn't get confirmation that cookies were cleared, continuing anyway");
            }
        }
        state.purge_pending = false;
        state.first_run = false;
    }

    /// Stage 5: a Chromium network-error page means the proxy could not
    /// reach the target at all.
    pub fn check_error_page(&self, html: &str, proxy: &ProxyRecord) -> Result<(), AcquireError> {
        if html.to_lowercase().contains(NET_ERROR_MARKER) {
            return Err(AcquireError::Proxy(format!(
                "Page couldn't be reached (proxy: {})",
                proxy.url()
            )));
        }
        Ok(())
    }

    /// Stage 6: only "challenge issued" (or no code at all) lets the attempt
    /// continue.
    pub fn classify_imperva(&self, html: &str, proxy: &ProxyRecord) -> Result<(), AcquireError> {
        let (code, reason) = imperva_error_code(html);
        if !imperva_code_passable(&code) {
            return Err(AcquireError::Login(format!(
                "Error code {} ({}) with proxy {}",
                code,
                reason,
                proxy.url()
            )));
        }
        debug!("Challenge page accepted (code {})", code);
        Ok(())
    }

    /// Stage 7: wait for the watched network response proving the in-page JS
    /// challenge completed, then drop the watch and reload.
    pub async fn await_js_challenge(&self, timeout: std::time::Duration) -> Result<(), AcquireError> {
        info!("Waiting for JS check");
        if !self.driver.await_watched_response(timeout).await? {
            return Err(AcquireError::Login("Timeout on JS challenge".to_string()));
        }

        self.driver.clear_response_watch().await;
        info!("JS check done, reloading");
        self.driver.reload().await?;
        Ok(())
    }

    /// Stage 8: bounded reload-confirmation loop.
    ///
    /// Error pages are sometimes observed before they finish rendering, so a
    /// missing marker with no concrete error code is retried after a short
    /// sleep instead of failing the attempt.
    pub async fn confirm_reload<F>(&self, check: F) -> Result<(), AcquireError>
    where
        F: Fn(&str) -> ReloadCheck,
    {
        for attempt in 1..=RELOAD_ATTEMPTS {
            debug!("Checking reload content #{}", attempt);
            let html = self.driver.get_content().await?;

            match check(&html) {
                ReloadCheck::Ready => {
                    info!("Finished reloading");
                    return Ok(());
                }
                ReloadCheck::ErrorPage => {
                    let (code, reason) = imperva_error_code(&html);
                    return Err(AcquireError::Login(format!(
                        "Didn't pass JS check. Code {code} ({reason})"
                    )));
                }
                ReloadCheck::NotYet => {
                    let (code, reason) = imperva_error_code(&html);
                    if code != IMPERVA_UNKNOWN {
                        return Err(AcquireError::Login(format!(
                            "Didn't pass JS check. Code {code} ({reason})"
                        )));
                    }
                    sleep(RELOAD_POLL).await;
                }
            }
        }

        Err(AcquireError::Login(
            "Timed out while waiting for reload to finish".to_string(),
        ))
    }

    /// Map a navigation failure: a timeout most often means a dead proxy,
    /// not a dead target.
    pub fn classify_navigation(err: BrowserError, proxy: &ProxyRecord) -> AcquireError {
        match err {
            BrowserError::Timeout(_) => {
                AcquireError::Proxy(format!("Page timed out (proxy: {})", proxy.url()))
            }
            other => AcquireError::Driver(other),
        }
    }
}
