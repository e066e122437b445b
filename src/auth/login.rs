//! Login-code flow: replay a reese-cookie bundle over HTTP, post
//! credentials and pull the login code out of the OAuth redirect.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::CookieBroker;
use crate::challenge::ReeseCookie;
use crate::ptc::{
    imperva_error_code, ACCESS_URL, BANNED_MARKER, IMPERVA_UNKNOWN, INVALID_CREDENTIALS_MARKER,
    LOGIN_FORM_MARKER,
};

const LOGIN_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_PAGE_REDIRECTS: u32 = 5;
/// One retry with a fresh cookie bundle when the wall reappears
const STALE_COOKIE_ROUNDS: u32 = 2;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum LoginError {
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("account is banned")]
    Banned,

    #[error("{0}")]
    Login(String),

    #[error("network error: {0}")]
    Network(String),
}

enum Attempt {
    /// The challenge wall reappeared; the cookie bundle is spent
    StaleCookie,
    Fatal(LoginError),
}

/// Drives the credential exchange against the identity provider, fetching
/// reese cookies from the broker as needed.
pub struct LoginFlow {
    broker: Arc<CookieBroker>,
}

impl LoginFlow {
    pub fn new(broker: Arc<CookieBroker>) -> Self {
        Self { broker }
    }

    /// Obtain a login code for the given credentials and authorize URL.
    pub async fn auth(
        &self,
        username: &str,
        password: &str,
        url: &str,
    ) -> Result<String, LoginError> {
        for _ in 0..STALE_COOKIE_ROUNDS {
            let cookie = self
                .broker
                .get_cookie()
                .await
                .map_err(|e| LoginError::Login(e.to_string()))?;

            match self.try_login(&cookie, username, password, url).await {
                Ok(code) => return Ok(code),
                Err(Attempt::StaleCookie) => {
                    info!("Challenge wall reappeared, refreshing session cookies");
                    self.broker.invalidate(&cookie).await;
                }
                Err(Attempt::Fatal(e)) => return Err(e),
            }
        }

        Err(LoginError::Login(
            "challenge wall persisted after refreshing session cookies".to_string(),
        ))
    }

    async fn try_login(
        &self,
        cookie: &ReeseCookie,
        username: &str,
        password: &str,
        url: &str,
    ) -> Result<String, Attempt> {
        let client = build_client(cookie)?;

        let (login_page_url, html) = fetch_login_page(&client, url).await?;

        let (code, _) = imperva_error_code(&html);
        if code != IMPERVA_UNKNOWN {
            return Err(Attempt::StaleCookie);
        }
        if !html.to_lowercase().contains(LOGIN_FORM_MARKER) {
            return Err(Attempt::StaleCookie);
        }

        let csrf = extract_csrf_token(&html).ok_or_else(|| {
            Attempt::Fatal(LoginError::Login("login page had no CSRF token".to_string()))
        })?;
        debug!("CSRF token extracted (len={})", csrf.len());

        let response = client
            .post(login_page_url.clone())
            .header("Referer", login_page_url.as_str())
            .form(&[
                ("_csrf", csrf.as_str()),
                ("username", username),
                ("password", password),
            ])
            .send()
            .await
            .map_err(|e| Attempt::Fatal(LoginError::Network(e.to_string())))?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    Attempt::Fatal(LoginError::Login(
                        "login redirect carried no location".to_string(),
                    ))
                })?;
            return extract_login_code(&login_page_url, location).map_err(Attempt::Fatal);
        }

        let body = response
            .text()
            .await
            .map_err(|e| Attempt::Fatal(LoginError::Network(e.to_string())))?;
        let lower = body.to_lowercase();

        if lower.contains(INVALID_CREDENTIALS_MARKER) {
            return Err(Attempt::Fatal(LoginError::InvalidCredentials));
        }
        if lower.contains(BANNED_MARKER) {
            return Err(Attempt::Fatal(LoginError::Banned));
        }

        let (code, _) = imperva_error_code(&body);
        if code != IMPERVA_UNKNOWN {
            return Err(Attempt::StaleCookie);
        }

        Err(Attempt::Fatal(LoginError::Login(format!(
            "unexpected login response (HTTP {status})"
        ))))
    }
}

/// Client pinned to the cookie bundle's proxy with the bundle pre-seeded.
/// Redirects are handled manually so the code-bearing Location is visible.
fn build_client(cookie: &ReeseCookie) -> Result<Client, Attempt> {
    let base = Url::parse(ACCESS_URL)
        .map_err(|e| Attempt::Fatal(LoginError::Login(e.to_string())))?;

    let jar = Jar::default();
    for (name, value) in &cookie.cookies {
        jar.add_cookie_str(&format!("{name}={value}; Path=/"), &base);
    }

    let proxy = reqwest::Proxy::all(cookie.proxy.full_url())
        .map_err(|e| Attempt::Fatal(LoginError::Network(e.to_string())))?;

    Client::builder()
        .timeout(LOGIN_HTTP_TIMEOUT)
        .cookie_provider(Arc::new(jar))
        .user_agent(USER_AGENT)
        .redirect(Policy::none())
        .proxy(proxy)
        .build()
        .map_err(|e| Attempt::Fatal(LoginError::Network(e.to_string())))
}

async fn fetch_login_page(client: &Client, url: &str) -> Result<(Url, String), Attempt> {
    let mut current =
        Url::parse(url).map_err(|e| Attempt::Fatal(LoginError::Login(e.to_string())))?;

    for _ in 0..MAX_PAGE_REDIRECTS {
        let response = client
            .get(current.clone())
            .send()
            .await
            .map_err(|e| Attempt::Fatal(LoginError::Network(e.to_string())))?;

        if response.status().is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    Attempt::Fatal(LoginError::Login(
                        "redirect carried no location".to_string(),
                    ))
                })?;
            current = current
                .join(location)
                .map_err(|e| Attempt::Fatal(LoginError::Login(e.to_string())))?;
            continue;
        }

        let html = response
            .text()
            .await
            .map_err(|e| Attempt::Fatal(LoginError::Network(e.to_string())))?;
        return Ok((current, html));
    }

    Err(Attempt::Fatal(LoginError::Login(
        "too many redirects fetching login page".to_string(),
    )))
}

/// Pull the `code` query parameter out of the post-login redirect.
fn extract_login_code(base: &Url, location: &str) -> Result<String, LoginError> {
    let target = base
        .join(location)
        .map_err(|e| LoginError::Login(format!("unparsable redirect location: {e}")))?;

    target
        .query_pairs()
        .find(|(key, _)| key == "code")
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| LoginError::Login("login redirect carried no code".to_string()))
}

/// Extract the CSRF token from the login page HTML.
fn extract_csrf_token(html: &str) -> Option<String> {
    // meta tag: <meta name="csrf-token" content="...">
    if let Some(start) = html.find("name=\"csrf-token\"") {
        if let Some(content_start) = html[start..].find("content=\"") {
            let token_start = start + content_start + 9;
            if let Some(token_end) = html[token_start..].find('"') {
                return Some(html[token_start..token_start + token_end].to_string());
            }
        }
    }

    // hidden input: <input type="hidden" name="_csrf" value="...">
    if let Some(start) = html.find("name=\"_csrf\"") {
        if let Some(value_start) = html[start..].find("value=\"") {
            let token_start = start + value_start + 7;
            if let Some(token_end) = html[token_start..].find('"') {
                return Some(html[token_start..token_start + token_end].to_string());
            }
        }
    }

    None
}
