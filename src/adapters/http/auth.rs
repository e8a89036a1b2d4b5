//! Cookie-based viewer authentication.
//!
//! Either the request carries the session token cookie, or authentication is
//! globally disabled (no credentials configured). The token is the SHA-256
//! digest of `username:password`, so restarting the viewer keeps sessions
//! valid as long as the credentials stand.

use axum::http::{HeaderMap, StatusCode, header};
use ring::digest;

pub const AUTH_COOKIE: &str = "viewer_auth";
const COOKIE_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub username: String,
    pub password: String,
    pub token: String,
}

impl AuthContext {
    pub fn from_credentials(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            token: auth_token(username, password),
        }
    }
}

pub fn auth_token(username: &str, password: &str) -> String {
    let input = format!("{username}:{password}");
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref().iter().map(|b| format!("{b:02x}")).collect()
}

/// Pull the session token from the Cookie header(s).
pub fn cookie_token(headers: &HeaderMap) -> Option<String> {
    for value in headers.get_all(header::COOKIE) {
        let Ok(raw) = value.to_str() else { continue };
        for pair in raw.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            if parts.next() == Some(AUTH_COOKIE) {
                if let Some(token) = parts.next() {
                    return Some(token.to_string());
                }
            }
        }
    }
    None
}

/// Enforce cookie auth when enabled.
pub fn require_auth(auth: Option<&AuthContext>, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(auth) = auth else {
        return Ok(());
    };
    match cookie_token(headers) {
        Some(token) if token == auth.token => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

pub fn session_cookie(token: &str) -> String {
    format!(
        "{AUTH_COOKIE}={token}; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}; Path=/"
    )
}

pub fn clear_cookie() -> String {
    format!("{AUTH_COOKIE}=; HttpOnly; SameSite=Lax; Max-Age=0; Path=/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_is_stable_hex_sha256() {
        let token = auth_token("admin", "secret");
        assert_eq!(token.len(), 64);
        assert_eq!(token, auth_token("admin", "secret"));
        assert_ne!(token, auth_token("admin", "other"));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; viewer_auth=abc123; lang=en"),
        );
        assert_eq!(cookie_token(&headers).as_deref(), Some("abc123"));
    }

    #[test]
    fn auth_disabled_admits_everyone() {
        let headers = HeaderMap::new();
        assert!(require_auth(None, &headers).is_ok());

        let auth = AuthContext::from_credentials("admin", "secret");
        assert_eq!(
            require_auth(Some(&auth), &headers),
            Err(StatusCode::UNAUTHORIZED)
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(&format!("viewer_auth={}", auth.token)).unwrap(),
        );
        assert!(require_auth(Some(&auth), &headers).is_ok());
    }
}
