//! The browser-driving seam.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use super::BrowserError;
use crate::proxy::ProxyRecord;

/// Capability set expected from a driven browser.
///
/// The acquisition state machine only ever talks to the browser through this
/// trait; anything that can go wrong surfaces as a [`BrowserError`] and is
/// treated as unclassified by the caller.
///
/// The response-watch triple carries the out-of-band "JS challenge finished"
/// signal: `watch_responses` is armed before navigation so the matching
/// network response cannot be missed, `await_watched_response` blocks with a
/// timeout, and `clear_response_watch` drops the listener once it has fired.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Start the browser if it is not already running.
    async fn start(&self) -> Result<(), BrowserError>;

    /// Tear the browser down. Safe to call when already stopped.
    async fn stop(&self) -> Result<(), BrowserError>;

    /// Replace the current tab with a fresh one.
    async fn new_page(&self) -> Result<(), BrowserError>;

    /// Load `url`, bounded by `timeout`. Expiry yields
    /// [`BrowserError::Timeout`].
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserError>;

    /// Reload the current page.
    async fn reload(&self) -> Result<(), BrowserError>;

    /// Fetch the current page content.
    async fn get_content(&self) -> Result<String, BrowserError>;

    /// Evaluate a script, returning its immediate value.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError>;

    /// Evaluate a script and await the promise it returns, bounded by
    /// `timeout`.
    async fn evaluate_async(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, BrowserError>;

    /// All cookies visible to the current page, name to value.
    async fn get_cookies(&self) -> Result<HashMap<String, String>, BrowserError>;

    /// Seed cookies into the browser before navigation, scoped to `url`.
    async fn set_cookies(
        &self,
        cookies: &HashMap<String, String>,
        url: &str,
    ) -> Result<(), BrowserError>;

    /// Tell the in-browser proxy extension to switch upstream proxies.
    /// Confirmation travels separately over the signal channel.
    async fn set_proxy(&self, proxy: &ProxyRecord) -> Result<(), BrowserError>;

    /// Start watching network responses whose URL starts with `url_prefix`.
    async fn watch_responses(&self, url_prefix: &str) -> Result<(), BrowserError>;

    /// Wait for the watched response. Returns false when `timeout` expires
    /// without a match.
    async fn await_watched_response(&self, timeout: Duration) -> Result<bool, BrowserError>;

    /// Drop the active response watch, if any.
    async fn clear_response_watch(&self);
}
