//! Join specialization: drive one attempt to a pre-solved join-token bundle
//! (reese cookies plus paired create/activate CAPTCHA tokens).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, info};

use super::{AcquireError, ProxyPenalty, ReloadCheck, SessionState, StageRunner};
use crate::browser::BrowserDriver;
use crate::proxy::ProxyRecord;
use crate::ptc::{
    CAPTCHA_IFRAME_MARKER, ERROR_IFRAME_MARKER, JOIN_URL, JS_CHALLENGE_TIMEOUT,
    TOKEN_COLLECT_TIMEOUT,
};
use crate::signal::SignalChannel;

/// Script injected into the join page to start harvesting CAPTCHA tokens
const HARVEST_SRC: &str = include_str!("../js/recaptcha.js");
/// Script whose promise settles with the harvested token arrays
const COLLECT_SRC: &str = include_str!("../js/collect.js");

/// One batch of pre-solved join tokens, tagged with the proxy that earned
/// them. This is the wire shape returned by the cion endpoint.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CionResponse {
    pub reese_cookie: HashMap<String, String>,
    pub create_tokens: Vec<String>,
    pub activate_tokens: Vec<String>,
    pub timestamp: i64,
    pub proxy: String,
}

/// One join-token acquisition attempt over the shared browser session.
pub struct JoinChallenge {
    runner: StageRunner,
}

impl JoinChallenge {
    pub fn new(driver: Arc<dyn BrowserDriver>, signal: Arc<dyn SignalChannel>) -> Self {
        Self {
            runner: StageRunner::new(driver, signal),
        }
    }

    /// Run one attempt. The caller holds the session lease; classification
    /// effects are applied before returning. Join mode treats a dead proxy
    /// as permanently dead.
    pub async fn run(
        &self,
        state: &mut SessionState,
        proxy: &Arc<ProxyRecord>,
    ) -> Result<CionResponse, AcquireError> {
        let result = self.attempt(state, proxy).await;
        self.settle(state, proxy, &result).await;
        result
    }

    async fn attempt(
        &self,
        state: &mut SessionState,
        proxy: &Arc<ProxyRecord>,
    ) -> Result<CionResponse, AcquireError> {
        self.runner.start_session(state).await?;
        let driver = self.runner.driver().clone();

        let timestamp = chrono::Utc::now().timestamp();

        driver.new_page().await?;
        driver.watch_responses(JOIN_URL).await?;

        // every join attempt brings its own proxy
        self.runner.propagate_proxy(proxy).await?;
        self.runner.await_cookie_purge(state).await;

        info!("Opening join page");
        driver
            .navigate(JOIN_URL, JS_CHALLENGE_TIMEOUT)
            .await
            .map_err(|e| StageRunner::classify_navigation(e, proxy))?;

        let html = driver.get_content().await?;
        self.runner.check_error_page(&html, proxy)?;
        self.runner.classify_imperva(&html, proxy)?;
        self.runner.await_js_challenge(JS_CHALLENGE_TIMEOUT).await?;
        self.runner.confirm_reload(join_page_rendered).await?;

        info!("Preparing token retrieval");
        driver.evaluate(HARVEST_SRC).await?;

        info!("Getting captcha tokens");
        let harvest = driver
            .evaluate_async(COLLECT_SRC, TOKEN_COLLECT_TIMEOUT)
            .await?;
        let (create_tokens, activate_tokens) = parse_harvest(&harvest)?;

        info!("Getting cookies from browser");
        let reese_cookie = driver.get_cookies().await?;

        Ok(CionResponse {
            reese_cookie,
            create_tokens,
            activate_tokens,
            timestamp,
            proxy: proxy.full_url(),
        })
    }

    async fn settle(
        &self,
        state: &mut SessionState,
        proxy: &Arc<ProxyRecord>,
        result: &Result<CionResponse, AcquireError>,
    ) {
        match result {
            Ok(_) => {
                state.consecutive_failures = 0;
                state.purge_pending = true;
            }
            Err(AcquireError::Login(msg)) => {
                error!("{} while getting tokens", msg);
                state.consecutive_failures += 1;
                state.purge_pending = true;
            }
            Err(AcquireError::Proxy(msg)) => {
                error!("{} while getting tokens", msg);
                ProxyPenalty::Invalidate.apply(proxy);
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
                    "Browser error while getting tokens, session will be restarted: {}",
                    e
                );
                state.consecutive_failures += 1;
                state.needs_restart = true;
                let _ = self.runner.driver().stop().await;
            }
        }
    }
}

fn join_page_rendered(html: &str) -> ReloadCheck {
    let lower = html.to_lowercase();
    if lower.contains(CAPTCHA_IFRAME_MARKER) {
        ReloadCheck::Ready
    } else if lower.contains(ERROR_IFRAME_MARKER) {
        ReloadCheck::ErrorPage
    } else {
        ReloadCheck::NotYet
    }
}

fn parse_harvest(value: &serde_json::Value) -> Result<(Vec<String>, Vec<String>), AcquireError> {
    let obj = value
        .as_object()
        .ok_or_else(|| AcquireError::Login("Token harvest returned no payload".to_string()))?;

    let create = token_list(obj.get("create"));
    let activate = token_list(obj.get("activate"));

    if create.is_empty() && activate.is_empty() {
        return Err(AcquireError::Login(
            "Token harvest produced no tokens".to_string(),
        ));
    }

    Ok((create, activate))
}

fn token_list(value: Option<&serde_json::Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
