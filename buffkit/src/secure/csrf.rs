//! CSRF protection using the double-submit cookie pattern.
//!
//! A random token is issued as a cookie on safe requests. State-changing
//! methods (POST/PUT/PATCH/DELETE) must present the same value in the
//! `x-csrf-token` header or an `authenticity_token` form field; anything
//! else is rejected with 403 before the handler runs.
//!
//! # Example
//!
//! ```rust,ignore
//! use buffkit::secure::ensure_csrf_token;
//!
//! async fn form_page(headers: HeaderMap) -> impl IntoResponse {
//!     let (token, set_cookie) = ensure_csrf_token(&headers, &config);
//!     let body = format!("<form method=\"post\">{}</form>", token.as_hidden_field());
//!     // attach set_cookie to the response when present
//! }
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rand::Rng;
use std::sync::Arc;

use crate::auth::parse_cookie;
use crate::components::html_escape;
use crate::config::SecurityConfig;

const TOKEN_LENGTH: usize = 32;
const HEADER_NAME: &str = "x-csrf-token";
const FORM_FIELD: &str = "authenticity_token";

/// A CSRF token and helpers for embedding it in markup.
#[derive(Debug, Clone)]
pub struct CsrfToken(String);

impl CsrfToken {
    /// Wrap an existing token value.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect();
        Self(token)
    }

    /// The raw token value.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.0
    }

    /// Hidden form field markup.
    #[must_use]
    pub fn as_hidden_field(&self) -> String {
        format!(
            r#"<input type="hidden" name="{FORM_FIELD}" value="{}">"#,
            html_escape(&self.0)
        )
    }

    /// Meta tag markup for JavaScript/HTMX access.
    #[must_use]
    pub fn as_meta_tag(&self) -> String {
        format!(
            r#"<meta name="csrf-token" content="{}">"#,
            html_escape(&self.0)
        )
    }
}

/// Read the CSRF token from the request's cookies, or mint a new one.
///
/// Returns the token plus a `Set-Cookie` value when one must be attached
/// to the response (i.e. the request did not already carry the cookie).
#[must_use]
pub fn ensure_csrf_token(
    headers: &HeaderMap,
    config: &SecurityConfig,
) -> (CsrfToken, Option<String>) {
    if let Some(existing) = cookie_token(headers, config) {
        return (CsrfToken::new(existing), None);
    }
    let token = CsrfToken::generate();
    let cookie = csrf_cookie(config, token.token());
    (token, Some(cookie))
}

fn cookie_token(headers: &HeaderMap, config: &SecurityConfig) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_cookie(value, &config.csrf_cookie_name))
}

fn csrf_cookie(config: &SecurityConfig, token: &str) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; SameSite=Lax",
        config.csrf_cookie_name, token
    );
    if config.tls_enabled {
        cookie.push_str("; Secure");
    }
    cookie
}

fn is_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// CSRF middleware.
///
/// Safe methods pass through; if neither the request nor the response
/// carries the token cookie, one is attached so later form posts can
/// succeed. Unsafe methods must echo the cookie's value via header or form
/// field.
pub async fn csrf_middleware(
    State(config): State<Arc<SecurityConfig>>,
    request: Request,
    next: Next,
) -> Response {
    if !config.csrf_enabled {
        return next.run(request).await;
    }

    if is_safe(request.method()) {
        let had_cookie = cookie_token(request.headers(), &config).is_some();
        let mut response = next.run(request).await;
        if !had_cookie && !response_sets_csrf_cookie(&response, &config) {
            let cookie = csrf_cookie(&config, CsrfToken::generate().token());
            if let Ok(value) = cookie.parse() {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        return response;
    }

    let Some(expected) = cookie_token(request.headers(), &config) else {
        return reject("missing CSRF cookie");
    };

    // Header first; cheapest and what HTMX sends.
    if let Some(provided) = request
        .headers()
        .get(HEADER_NAME)
        .and_then(|value| value.to_str().ok())
    {
        if provided == expected {
            return next.run(request).await;
        }
        return reject("CSRF token mismatch");
    }

    // Form posts carry the token as a field; buffer, check, and replay the
    // body for the handler.
    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);
    if !is_form {
        return reject("missing CSRF token");
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => return reject("unreadable request body"),
    };

    let matches = form_urlencoded::parse(&bytes)
        .any(|(name, value)| name == FORM_FIELD && value == expected);
    if !matches {
        return reject("CSRF token mismatch");
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

fn response_sets_csrf_cookie(response: &Response, config: &SecurityConfig) -> bool {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.starts_with(&format!("{}=", config.csrf_cookie_name)))
}

fn reject(reason: &'static str) -> Response {
    tracing::debug!(reason, "request rejected by CSRF middleware");
    (StatusCode::FORBIDDEN, "invalid or missing CSRF token").into_response()
}
