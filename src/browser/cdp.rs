//! CDP-backed implementation of [`BrowserDriver`] on chromiumoxide.
//!
//! Launches a real Chromium with the proxy-bridge and fingerprint extensions
//! loaded, and keeps exactly one tab. Proxy switching is delegated to the
//! in-browser extension via the signal bridge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig, HeadlessMode};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, EventResponseReceived};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BrowserDriver, BrowserError};
use crate::proxy::ProxyRecord;
use crate::signal::{SignalChannel, SET_PROXY};

/// Find Chrome/Chromium executable on the system.
/// Chromium comes first: Google Chrome refuses to load unpacked extensions,
/// which the proxy bridge depends on.
fn find_chrome() -> Option<std::path::PathBuf> {
    let candidates: Vec<std::path::PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            std::path::PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            std::path::PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(std::path::PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![std::path::PathBuf::from(
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        )]
    } else {
        vec![
            std::path::PathBuf::from("/usr/bin/chromium"),
            std::path::PathBuf::from("/usr/bin/chromium-browser"),
            std::path::PathBuf::from("/usr/bin/google-chrome"),
            std::path::PathBuf::from("/usr/bin/google-chrome-stable"),
        ]
    };

    candidates.into_iter().find(|p| p.exists())
}

/// Launch configuration for the CDP browser.
#[derive(Debug, Clone)]
pub struct CdpBrowserConfig {
    /// Explicit Chrome path; auto-detected when unset
    pub chrome_path: Option<String>,
    pub headless: bool,
    /// Unpacked extension directories loaded at launch
    pub extension_dirs: Vec<String>,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for CdpBrowserConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: true,
            extension_dirs: Vec::new(),
            window_width: 1920,
            window_height: 1080,
        }
    }
}

struct ResponseWatch {
    rx: oneshot::Receiver<()>,
    task: tokio::task::JoinHandle<()>,
}

/// chromiumoxide-backed browser driver.
pub struct CdpBrowser {
    config: CdpBrowserConfig,
    signal: Arc<dyn SignalChannel>,
    browser: RwLock<Option<Browser>>,
    page: RwLock<Option<Page>>,
    watch: Mutex<Option<ResponseWatch>>,
}

impl CdpBrowser {
    pub fn new(config: CdpBrowserConfig, signal: Arc<dyn SignalChannel>) -> Self {
        Self {
            config,
            signal,
            browser: RwLock::new(None),
            page: RwLock::new(None),
            watch: Mutex::new(None),
        }
    }

    fn build_config(&self) -> Result<BrowserConfig, BrowserError> {
        let mut builder = BrowserConfig::builder();

        if self.config.headless {
            builder = builder.headless_mode(HeadlessMode::New);
        } else {
            builder = builder.with_head();
        }

        if let Some(ref path) = self.config.chrome_path {
            builder = builder.chrome_executable(path);
        } else if let Some(path) = find_chrome() {
            info!("Auto-detected Chrome at: {}", path.display());
            builder = builder.chrome_executable(path);
        } else {
            return Err(BrowserError::LaunchFailed(
                "No Chromium/Chrome executable found; set chrome_path in config".to_string(),
            ));
        }

        // Fresh profile per launch; the extension purges cookies between runs
        let data_dir = std::env::temp_dir()
            .join("ptc-gateway")
            .join("browser_data")
            .join(Uuid::new_v4().to_string());
        let _ = std::fs::create_dir_all(&data_dir);
        builder = builder.user_data_dir(&data_dir);

        for ext in &self.config.extension_dirs {
            debug!("Loading extension from: {}", ext);
            builder = builder.extension(ext);
        }

        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--no-default-browser-check")
            .arg("--disable-session-crashed-bubble")
            .arg("--disable-notifications")
            .arg("--disable-component-update")
            // Required when running as root (e.g., in Docker or on a VPS)
            .arg("--no-sandbox")
            .window_size(self.config.window_width, self.config.window_height);

        builder.build().map_err(BrowserError::LaunchFailed)
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowser {
    async fn start(&self) -> Result<(), BrowserError> {
        if self.browser.read().await.is_some() {
            return Ok(());
        }

        let browser_config = self.build_config()?;

        info!("Launching browser (headless: {})", self.config.headless);
        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // When the handler ends, Chrome has disconnected or crashed
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            warn!("Chrome disconnected (event handler ended)");
        });

        // Chrome opens with a blank tab; take it, close extras
        let page = {
            let mut pages = browser
                .pages()
                .await
                .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

            let main_page = if !pages.is_empty() {
                pages.remove(0)
            } else {
                browser
                    .new_page("about:blank")
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?
            };

            for extra in pages {
                let _ = extra.close().await;
            }

            main_page
        };

        *self.browser.write().await = Some(browser);
        *self.page.write().await = Some(page);

        info!("Browser session started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), BrowserError> {
        self.clear_response_watch().await;

        {
            let mut page = self.page.write().await;
            if let Some(p) = page.take() {
                let _ = p.close().await;
            }
        }

        {
            let mut browser = self.browser.write().await;
            if let Some(mut b) = browser.take() {
                // Graceful close first, then force kill so no Chrome
                // processes linger
                let _ = b.close().await;
                tokio::time::sleep(Duration::from_millis(500)).await;
                let _ = b.kill().await;
                info!("Browser session stopped");
            }
        }

        Ok(())
    }

    async fn new_page(&self) -> Result<(), BrowserError> {
        self.clear_response_watch().await;

        let browser = self.browser.read().await;
        let browser = browser
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("Browser not started".into()))?;

        let fresh = browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;

        let mut page = self.page.write().await;
        if let Some(old) = page.replace(fresh) {
            let _ = old.close().await;
        }

        Ok(())
    }

    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        debug!("Navigating to: {}", url);
        tokio::time::timeout(timeout, page.goto(url))
            .await
            .map_err(|_| BrowserError::Timeout("Navigation timeout".into()))?
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

        Ok(())
    }

    async fn reload(&self) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        page.reload()
            .await
            .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;
        Ok(())
    }

    async fn get_content(&self) -> Result<String, BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        page.content()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let result = page
            .evaluate(script.to_string())
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn evaluate_async(
        &self,
        script: &str,
        timeout: Duration,
    ) -> Result<serde_json::Value, BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(BrowserError::JavaScriptError)?;

        let result = tokio::time::timeout(timeout, page.evaluate(params))
            .await
            .map_err(|_| {
                BrowserError::Timeout(format!("Script promise not settled after {timeout:?}"))
            })?
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn get_cookies(&self) -> Result<HashMap<String, String>, BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let cookies = page
            .get_cookies()
            .await
            .map_err(|e| BrowserError::CookieError(e.to_string()))?;

        Ok(cookies
            .into_iter()
            .map(|c| (c.name, c.value))
            .collect())
    }

    async fn set_cookies(
        &self,
        cookies: &HashMap<String, String>,
        url: &str,
    ) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let mut params = Vec::with_capacity(cookies.len());
        for (name, value) in cookies {
            let param = CookieParam::builder()
                .name(name)
                .value(value)
                .url(url)
                .build()
                .map_err(BrowserError::CookieError)?;
            params.push(param);
        }

        page.set_cookies(params)
            .await
            .map_err(|e| BrowserError::CookieError(e.to_string()))?;
        Ok(())
    }

    async fn set_proxy(&self, proxy: &ProxyRecord) -> Result<(), BrowserError> {
        let payload = serde_json::json!({
            "host": proxy.host,
            "port": proxy.port,
            "scheme": proxy.scheme,
            "username": proxy.username,
            "password": proxy.password,
        });

        self.signal
            .publish(SET_PROXY, payload)
            .await
            .map_err(|e| BrowserError::BridgeError(e.to_string()))
    }

    async fn watch_responses(&self, url_prefix: &str) -> Result<(), BrowserError> {
        let page = self.page.read().await;
        let page = page
            .as_ref()
            .ok_or(BrowserError::ConnectionLost("No active page".into()))?;

        let mut events = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;

        let prefix = url_prefix.to_string();
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut tx = Some(tx);
            while let Some(event) = events.next().await {
                if event.response.url.starts_with(&prefix) {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(());
                    }
                    break;
                }
            }
        });

        let mut watch = self.watch.lock().await;
        if let Some(old) = watch.replace(ResponseWatch { rx, task }) {
            old.task.abort();
        }

        Ok(())
    }

    async fn await_watched_response(&self, timeout: Duration) -> Result<bool, BrowserError> {
        let watch = self.watch.lock().await.take();
        let Some(watch) = watch else {
            return Ok(false);
        };

        match tokio::time::timeout(timeout, watch.rx).await {
            Ok(Ok(())) => Ok(true),
            // listener ended without a match
            Ok(Err(_)) => Ok(false),
            Err(_) => {
                watch.task.abort();
                Ok(false)
            }
        }
    }

    async fn clear_response_watch(&self) {
        if let Some(watch) = self.watch.lock().await.take() {
            watch.task.abort();
        }
    }
}
