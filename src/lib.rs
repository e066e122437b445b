//! PTC Gateway
//!
//! A proxy-rotating gateway that acquires session cookies, login codes and
//! CAPTCHA join tokens from a challenge-walled identity provider, and serves
//! them over a small HTTP API.

pub mod auth;
pub mod browser;
pub mod challenge;
pub mod join;
pub mod proxy;
pub mod ptc;
pub mod signal;
pub mod tasks;
pub mod web;

#[cfg(test)]
pub(crate) mod testkit;

use std::path::PathBuf;
use tracing::{info, warn};

/// Application configuration, loaded once at startup from `config.json`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Bind address for the HTTP API
    pub host: String,
    pub port: u16,

    /// Run in cion (join-token) mode instead of interactive auth mode
    pub cion_mode: bool,

    /// Path to the proxy list, one proxy per line
    pub proxies_list_path: String,

    /// Unpacked extension directories loaded into the browser
    pub proxy_extension: String,
    pub targetfp_extension: String,

    /// Port the extensions connect back to
    pub bridge_port: u16,

    /// Chrome/Chromium executable (auto-detected when unset)
    pub chrome_path: Option<String>,
    pub headless: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5090,
            cion_mode: false,
            proxies_list_path: "proxies.txt".to_string(),
            proxy_extension: "extensions/proxy-bridge".to_string(),
            targetfp_extension: "extensions/targetfp".to_string(),
            bridge_port: 5091,
            chrome_path: None,
            headless: true,
        }
    }
}

impl AppConfig {
    /// Load config from `config.json` in the working directory.
    /// Falls back to defaults when the file is missing or unreadable.
    pub fn load() -> Self {
        let path = PathBuf::from("config.json");
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => {
                        info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        warn!("Failed to parse config file: {}", e);
                    }
                },
                Err(e) => {
                    warn!("Failed to read config file: {}", e);
                }
            }
        }
        Self::default()
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ptc-gateway").join("logs"))
}

/// Initialize logging with a console layer and a daily-rolling file layer.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "ptc-gateway.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
