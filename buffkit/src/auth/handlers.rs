//! Login, logout, and the session middleware chain.

use askama::Template;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
    Form, Router,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::events::{AuthEvent, AuthEvents};
use super::flash::{self, FlashMessage};
use super::password::PasswordHasher;
use super::rate_limit::{RateDecision, RateLimiter};
use super::session::{parse_cookie, SessionService};
use super::store::UserStore;
use crate::audit::{AuditEntry, AuditKind, AuditStatus, AuditStore};
use crate::config::{AuthConfig, SecurityConfig};
use crate::error::{Error, ThrottleReason};
use crate::secure::ensure_csrf_token;

/// Everything the auth endpoints and middleware need, injected explicitly.
#[derive(Clone)]
pub struct AuthState {
    /// Account store
    pub users: Arc<dyn UserStore>,
    /// Session service
    pub sessions: Arc<SessionService>,
    /// Login rate limiter
    pub limiter: Arc<dyn RateLimiter>,
    /// Password hasher
    pub hasher: Arc<PasswordHasher>,
    /// Audit trail
    pub audit: Arc<dyn AuditStore>,
    /// Event bus
    pub events: AuthEvents,
    /// Auth policy
    pub config: AuthConfig,
    /// Security settings (TLS flag drives cookie attributes)
    pub security: Arc<SecurityConfig>,
}

impl AuthState {
    /// Create an account: validate, hash, store, audit, publish.
    ///
    /// There is no built-in registration endpoint; hosts own that form
    /// and call this from their handler. The welcome mail rides the
    /// published event.
    ///
    /// # Errors
    ///
    /// Validation errors for a malformed email, a weak password, or a
    /// taken address; store errors otherwise.
    pub async fn register_user(
        &self,
        email: &str,
        password: &str,
        name: Option<String>,
    ) -> crate::error::Result<super::model::User> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::invalid_field("email", "enter a valid email address"));
        }
        if self.users.exists_email(&email).await? {
            return Err(Error::invalid_field("email", "email is already taken"));
        }

        let digest = self.hasher.hash(password)?;
        let user = self
            .users
            .create(super::model::NewUser {
                email,
                password_digest: digest,
                name,
                extra: std::collections::HashMap::new(),
            })
            .await?;

        let _ = self
            .audit
            .record(
                AuditEntry::new(AuditKind::Register, AuditStatus::Success).user(&user.id),
            )
            .await;
        self.events.publish(AuthEvent::UserRegistered {
            user_id: user.id.clone(),
            email: user.email.clone(),
        });
        Ok(user)
    }
}

/// The authenticated user, inserted into request extensions by
/// [`load_session`].
#[derive(Debug, Clone)]
pub struct CurrentUser(pub super::model::User);

/// The raw session token for the current request.
#[derive(Debug, Clone)]
pub struct SessionToken(pub String);

#[derive(Template)]
#[template(path = "login.html")]
struct LoginPage {
    error: Option<String>,
    flashes: Vec<FlashMessage>,
    csrf_field: String,
    login_path: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    #[serde(default)]
    email: String,
    #[serde(default)]
    password: String,
}

/// Build the auth router: `GET login`, `POST login`, `POST /logout`.
pub fn auth_routes(state: AuthState) -> Router {
    let login_path = state.config.login_path.clone();
    Router::new()
        .route(&login_path, get(login_form).post(login_submit))
        .route("/logout", post(logout))
        .with_state(state)
}

/// First value of `X-Forwarded-For`, falling back to `"unknown"`.
fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn session_token(headers: &HeaderMap, sessions: &SessionService) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| parse_cookie(value, sessions.cookie_name()))
}

async fn login_form(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let (csrf, set_cookie) = ensure_csrf_token(&headers, &state.security);

    let flashes = match session_token(&headers, &state.sessions) {
        Some(token) => flash::take(&state.sessions, &token).await.unwrap_or_default(),
        None => Vec::new(),
    };

    let page = LoginPage {
        error: None,
        flashes,
        csrf_field: csrf.as_hidden_field(),
        login_path: state.config.login_path.clone(),
        email: String::new(),
    };
    render_login(page, StatusCode::OK, set_cookie)
}

fn render_login(page: LoginPage, status: StatusCode, set_cookie: Option<String>) -> Response {
    let body = match page.render() {
        Ok(body) => body,
        Err(e) => {
            tracing::error!("login template failed to render: {e}");
            return Error::Internal("template rendering failed".into()).into_response();
        }
    };
    let mut response = (status, Html(body)).into_response();
    if let Some(cookie) = set_cookie {
        if let Ok(value) = cookie.parse() {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
    response
}

/// The generic failure page. Identical for unknown accounts and wrong
/// passwords so responses do not enumerate users.
fn login_failure(state: &AuthState, headers: &HeaderMap, email: &str) -> Response {
    let (csrf, set_cookie) = ensure_csrf_token(headers, &state.security);
    let page = LoginPage {
        error: Some("Invalid email or password".to_string()),
        flashes: Vec::new(),
        csrf_field: csrf.as_hidden_field(),
        login_path: state.config.login_path.clone(),
        email: email.to_string(),
    };
    render_login(page, StatusCode::UNAUTHORIZED, set_cookie)
}

async fn login_submit(
    State(state): State<AuthState>,
    headers: HeaderMap,
    Form(form): Form<LoginForm>,
) -> Response {
    let email = form.email.trim().to_lowercase();
    let ip = client_ip(&headers);
    let agent = user_agent(&headers);

    // Rate limit before anything touches the user record.
    match state.limiter.check(&email, &ip).await {
        Ok(RateDecision::Allow) => {}
        Ok(RateDecision::Deny {
            reason,
            retry_after_secs,
        }) => {
            let _ = state
                .audit
                .record(
                    AuditEntry::new(AuditKind::Login, AuditStatus::Failure)
                        .origin(Some(ip), agent)
                        .meta("email", email.as_str())
                        .with_error(reason.phrase()),
                )
                .await;
            return Error::throttled(reason, retry_after_secs).into_response();
        }
        Err(e) => return e.into_response(),
    }

    let user = match state.users.by_email(&email).await {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };

    let Some(user) = user else {
        // Burn a verification so unknown emails cost the same as wrong
        // passwords, then fail generically.
        state.hasher.verify_dummy(&form.password);
        let _ = state.limiter.record_failure(&email, &ip).await;
        let _ = state
            .audit
            .record(
                AuditEntry::new(AuditKind::Login, AuditStatus::Failure)
                    .origin(Some(ip), agent)
                    .meta("email", email.as_str())
                    .with_error("invalid credentials"),
            )
            .await;
        return login_failure(&state, &headers, &email);
    };

    let now = Utc::now();
    if user.is_locked(now) {
        let remaining = user.lock_remaining_secs(now);
        let _ = state
            .audit
            .record(
                AuditEntry::new(AuditKind::Login, AuditStatus::Failure)
                    .user(&user.id)
                    .origin(Some(ip), agent)
                    .with_error(ThrottleReason::Locked.phrase()),
            )
            .await;
        return Error::throttled(ThrottleReason::Locked, remaining).into_response();
    }

    match state.hasher.verify(&form.password, &user.password_digest) {
        Err(e) => e.into_response(),
        Ok(false) => {
            let _ = state.limiter.record_failure(&email, &ip).await;

            // Lock once the counter reaches the threshold.
            let will_lock = user.failed_logins + 1 >= state.config.max_attempts_per_email;
            let locked_until = will_lock
                .then(|| now + Duration::seconds(state.config.lockout_secs as i64));
            match state
                .users
                .record_login_failure(&user.id, locked_until)
                .await
            {
                Ok(_count) => {}
                Err(e) => return e.into_response(),
            }

            if let Some(until) = locked_until {
                tracing::warn!(user_id = %user.id, "account locked after repeated login failures");
                let _ = state
                    .audit
                    .record(
                        AuditEntry::new(AuditKind::AccountLocked, AuditStatus::Success)
                            .user(&user.id)
                            .meta("until", until.to_rfc3339()),
                    )
                    .await;
                state.events.publish(AuthEvent::AccountLocked {
                    email: user.email.clone(),
                    until,
                });
            }

            let _ = state
                .audit
                .record(
                    AuditEntry::new(AuditKind::Login, AuditStatus::Failure)
                        .user(&user.id)
                        .origin(Some(ip), agent)
                        .with_error("invalid credentials"),
                )
                .await;
            login_failure(&state, &headers, &email)
        }
        Ok(true) => {
            if let Err(e) = state.users.reset_login_failures(&user.id).await {
                return e.into_response();
            }
            let _ = state.limiter.record_success(&email, &ip).await;

            let session = match state
                .sessions
                .issue(&user.id, Some(ip.clone()), agent.clone())
                .await
            {
                Ok(session) => session,
                Err(e) => return e.into_response(),
            };
            let _ = FlashMessage::success("Signed in")
                .push(&state.sessions, &session.token)
                .await;

            let _ = state
                .audit
                .record(
                    AuditEntry::new(AuditKind::Login, AuditStatus::Success)
                        .user(&user.id)
                        .origin(Some(ip.clone()), agent.clone()),
                )
                .await;
            let _ = state
                .audit
                .record(
                    AuditEntry::new(AuditKind::SessionCreated, AuditStatus::Success)
                        .user(&user.id)
                        .origin(Some(ip), agent),
                )
                .await;
            state.events.publish(AuthEvent::UserLoggedIn {
                user_id: user.id.clone(),
                email: user.email.clone(),
            });

            let cookie = state
                .sessions
                .cookie_for(&session.token, state.security.tls_enabled);
            let mut response =
                Redirect::to(&state.config.after_login_path).into_response();
            if let Ok(value) = cookie.parse() {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            response
        }
    }
}

async fn logout(State(state): State<AuthState>, headers: HeaderMap) -> Response {
    let ip = client_ip(&headers);
    let agent = user_agent(&headers);

    if let Some(token) = session_token(&headers, &state.sessions) {
        let user_id = state
            .sessions
            .store()
            .get(&token)
            .await
            .ok()
            .flatten()
            .map(|session| session.user_id);

        if let Err(e) = state.sessions.revoke(&token).await {
            tracing::error!("failed to revoke session on logout: {e}");
        }

        if let Some(user_id) = user_id {
            let _ = state
                .audit
                .record(
                    AuditEntry::new(AuditKind::Logout, AuditStatus::Success)
                        .user(&user_id)
                        .origin(Some(ip.clone()), agent.clone()),
                )
                .await;
            let _ = state
                .audit
                .record(
                    AuditEntry::new(AuditKind::SessionDestroyed, AuditStatus::Success)
                        .user(&user_id)
                        .origin(Some(ip), agent),
                )
                .await;
            state
                .events
                .publish(AuthEvent::UserLoggedOut { user_id });
        }
    }

    let mut response = Redirect::to(&state.config.after_logout_path).into_response();
    let clearing = state
        .sessions
        .clearing_cookie(state.security.tls_enabled);
    if let Ok(value) = clearing.parse() {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// Middleware: resolve the session cookie into [`CurrentUser`] and
/// [`SessionToken`] request extensions. Anonymous requests pass through
/// untouched; store errors log and degrade to anonymous rather than
/// failing the request.
pub async fn load_session(
    State(state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    if let Some(token) = session_token(request.headers(), &state.sessions) {
        match state
            .sessions
            .authenticate(&token, state.users.as_ref())
            .await
        {
            Ok(Some((_session, user))) => {
                request.extensions_mut().insert(CurrentUser(user));
                request.extensions_mut().insert(SessionToken(token));
            }
            Ok(None) => {}
            Err(e) => tracing::error!("session lookup failed: {e}"),
        }
    }
    next.run(request).await
}

/// Middleware: reject anonymous requests with a redirect to the login
/// path. Must run inside [`load_session`].
pub async fn require_login(
    State(state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    if request.extensions().get::<CurrentUser>().is_none() {
        return Redirect::to(&state.config.login_path).into_response();
    }
    next.run(request).await
}
