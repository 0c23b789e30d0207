//! Security middleware: response headers and CSRF protection.
//!
//! Headers are applied with `tower-http`'s `SetResponseHeaderLayer` per
//! configuration; HSTS is only sent when TLS is active. CSRF uses the
//! double-submit cookie pattern so the login form itself is protected
//! without needing a pre-existing session: state-changing requests must
//! echo the `_csrf` cookie's value in the `x-csrf-token` header or the
//! `authenticity_token` form field.

mod csrf;
mod headers;

pub use csrf::{csrf_middleware, ensure_csrf_token, CsrfToken};
pub use headers::apply_security_headers;
