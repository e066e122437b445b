//! Identity-provider specifics: target URLs, stage timeouts, and
//! classification of the challenge wall's error pages.

use std::time::Duration;

/// Base URL of the interactive auth frontend
pub const ACCESS_URL: &str = "https://access.pokemon.com/";
/// Join page guarded by the challenge wall + reCAPTCHA
pub const JOIN_URL: &str = "https://join.pokemon.com/";

/// Login page under [`ACCESS_URL`]
pub fn login_url() -> String {
    format!("{ACCESS_URL}login")
}

/// Overall deadline applied by the login-code endpoint. Strictly larger than
/// the worst-case stage path (page load + JS challenge + reload loop).
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(150);

/// Page-load and content-fetch cap in auth mode
pub const PAGE_LOAD_TIMEOUT: Duration = Duration::from_secs(20);
/// Confirmation wait for proxy/cookie-purge propagation; expiry is non-fatal
pub const PROPAGATION_TIMEOUT: Duration = Duration::from_secs(2);
/// Wait for the in-page JS challenge to complete
pub const JS_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(100);
/// Wait for the token collector promise to settle
pub const TOKEN_COLLECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded reload-confirmation loop: attempts and inter-attempt sleep
pub const RELOAD_ATTEMPTS: u32 = 10;
pub const RELOAD_POLL: Duration = Duration::from_millis(500);

/// Chromium renders its network error pages with this CSS class
pub const NET_ERROR_MARKER: &str = "neterror";
/// The login form rendered once the wall lets us through (auth mode)
pub const LOGIN_FORM_MARKER: &str = "log in";
/// reCAPTCHA widget iframe on the join page
pub const CAPTCHA_IFRAME_MARKER: &str = "title=\"recaptcha\"";
/// The wall's own error pages render inside this iframe
pub const ERROR_IFRAME_MARKER: &str = "id=\"main-iframe\"";

/// Provider response markers inspected by the login flow
pub const INVALID_CREDENTIALS_MARKER: &str = "your username or password is incorrect";
pub const BANNED_MARKER: &str = "account has been disabled";

/// The code meaning "challenge issued, proceed"
pub const IMPERVA_CHALLENGE_CODE: &str = "15";
/// Sentinel returned when no code can be found in the page
pub const IMPERVA_UNKNOWN: &str = "?";

/// Extract the Imperva error code from page content.
///
/// The code shows up either as literal text ("Error code 15") or inside the
/// block-page resource URL ("...&edet=15&..."). Returns `("?", ...)` when
/// neither is present, which callers treat as "page not fully rendered yet".
pub fn imperva_error_code(html: &str) -> (String, String) {
    let lower = html.to_lowercase();

    let code = scan_digits_after(&lower, "error code ")
        .or_else(|| scan_digits_after(&lower, "edet="));

    match code {
        Some(code) => {
            let reason = imperva_reason(&code);
            (code, reason.to_string())
        }
        None => (IMPERVA_UNKNOWN.to_string(), "no error code found".to_string()),
    }
}

/// Is this a code that allows the attempt to continue?
pub fn imperva_code_passable(code: &str) -> bool {
    code == IMPERVA_CHALLENGE_CODE || code == IMPERVA_UNKNOWN
}

fn scan_digits_after(haystack: &str, needle: &str) -> Option<String> {
    let start = haystack.find(needle)? + needle.len();
    let digits: String = haystack[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

fn imperva_reason(code: &str) -> &'static str {
    match code {
        "15" => "JavaScript challenge issued",
        "16" => "request blocked by security rules",
        "18" => "access denied",
        "20" => "origin unreachable",
        "22" => "session flagged",
        _ => "unknown reason",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_from_literal_text() {
        let html = "<html><body><h1>Error code 15</h1></body></html>";
        let (code, reason) = imperva_error_code(html);
        assert_eq!(code, "15");
        assert_eq!(reason, "JavaScript challenge issued");
    }

    #[test]
    fn test_code_from_resource_url() {
        let html = r#"<iframe src="/_wall_resource?SWUDNSAI=31&xinfo=4-1&edet=16&cinfo=ffffffff"></iframe>"#;
        let (code, _) = imperva_error_code(html);
        assert_eq!(code, "16");
    }

    #[test]
    fn test_unknown_sentinel_when_no_code() {
        let (code, _) = imperva_error_code("<html><body>half rendered");
        assert_eq!(code, IMPERVA_UNKNOWN);
    }

    #[test]
    fn test_passable_codes() {
        assert!(imperva_code_passable("15"));
        assert!(imperva_code_passable("?"));
        assert!(!imperva_code_passable("16"));
        assert!(!imperva_code_passable("20"));
    }

    #[test]
    fn test_case_insensitive_scan() {
        let (code, _) = imperva_error_code("ERROR CODE 20 something");
        assert_eq!(code, "20");
    }
}
