//! Scripted collaborator doubles for exercising the acquisition state
//! machine without a real browser or extension.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::browser::{BrowserDriver, BrowserError};
use crate::proxy::ProxyRecord;
use crate::signal::{SignalChannel, SignalError};

/// Driver double driven by a queued content script.
///
/// `get_content` pops queued pages and keeps repeating the last one, so a
/// two-entry queue models "challenge page, then whatever every reload probe
/// sees".
#[derive(Default)]
pub struct MockDriver {
    contents: Mutex<VecDeque<String>>,
    cookies: Mutex<HashMap<String, String>>,
    harvest: Mutex<serde_json::Value>,
    navigate_error: Mutex<Option<BrowserError>>,
    start_error: Mutex<Option<String>>,
    challenge_completes: AtomicBool,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    navigate_calls: AtomicU32,
    content_calls: AtomicU32,
    set_proxy_calls: AtomicU32,
}

impl MockDriver {
    pub fn with_contents(self, pages: Vec<&str>) -> Self {
        *self.contents.lock() = pages.into_iter().map(String::from).collect();
        self
    }

    pub fn with_cookie(self, name: &str, value: &str) -> Self {
        self.cookies.lock().insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_harvest(self, value: serde_json::Value) -> Self {
        *self.harvest.lock() = value;
        self
    }

    pub fn complete_challenge(&self, completes: bool) {
        self.challenge_completes.store(completes, Ordering::Relaxed);
    }

    pub fn fail_navigate(&self, err: BrowserError) {
        *self.navigate_error.lock() = Some(err);
    }

    pub fn fail_start(&self, msg: &str) {
        *self.start_error.lock() = Some(msg.to_string());
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::Relaxed)
    }

    pub fn stop_calls(&self) -> u32 {
        self.stop_calls.load(Ordering::Relaxed)
    }

    pub fn navigate_calls(&self) -> u32 {
        self.navigate_calls.load(Ordering::Relaxed)
    }

    pub fn content_calls(&self) -> u32 {
        self.content_calls.load(Ordering::Relaxed)
    }

    pub fn set_proxy_calls(&self) -> u32 {
        self.set_proxy_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn start(&self) -> Result<(), BrowserError> {
        self.start_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(msg) = self.start_error.lock().clone() {
            return Err(BrowserError::LaunchFailed(msg));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrowserError> {
        self.stop_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn new_page(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn navigate(&self, _url: &str, _timeout: Duration) -> Result<(), BrowserError> {
        self.navigate_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(err) = self.navigate_error.lock().take() {
            return Err(err);
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn get_content(&self) -> Result<String, BrowserError> {
        self.content_calls.fetch_add(1, Ordering::Relaxed);
        let mut contents = self.contents.lock();
        match contents.len() {
            0 => Ok(String::new()),
            1 => Ok(contents.front().cloned().unwrap_or_default()),
            _ => Ok(contents.pop_front().unwrap_or_default()),
        }
    }

    async fn evaluate(&self, _script: &str) -> Result<serde_json::Value, BrowserError> {
        Ok(serde_json::Value::Null)
    }

    async fn evaluate_async(
        &self,
        _script: &str,
        _timeout: Duration,
    ) -> Result<serde_json::Value, BrowserError> {
        Ok(self.harvest.lock().clone())
    }

    async fn get_cookies(&self) -> Result<HashMap<String, String>, BrowserError> {
        Ok(self.cookies.lock().clone())
    }

    async fn set_cookies(
        &self,
        _cookies: &HashMap<String, String>,
        _url: &str,
    ) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn set_proxy(&self, _proxy: &ProxyRecord) -> Result<(), BrowserError> {
        self.set_proxy_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn watch_responses(&self, _url_prefix: &str) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn await_watched_response(&self, _timeout: Duration) -> Result<bool, BrowserError> {
        Ok(self.challenge_completes.load(Ordering::Relaxed))
    }

    async fn clear_response_watch(&self) {}
}

/// Signal double: publishes succeed silently and confirmation waits resolve
/// instantly unconfirmed, exercising the degrade-and-continue paths.
#[derive(Default)]
pub struct MockSignal {
    confirm: AtomicBool,
}

#[async_trait]
impl SignalChannel for MockSignal {
    async fn publish(&self, _event: &str, _payload: serde_json::Value) -> Result<(), SignalError> {
        Ok(())
    }

    async fn await_event(&self, _event: &str, _timeout: Duration) -> bool {
        self.confirm.load(Ordering::Relaxed)
    }
}
