//! Security response headers

use axum::http::HeaderValue;
use axum::Router;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::config::SecurityConfig;

/// Apply security headers to the router based on configuration.
///
/// HSTS is only attached when TLS is active -- HSTS over plain HTTP is
/// meaningless and potentially confusing.
pub fn apply_security_headers(mut app: Router, config: &SecurityConfig) -> Router {
    if !config.headers_enabled {
        return app;
    }

    if config.tls_enabled && config.hsts {
        let value = format!("max-age={}", config.hsts_max_age_secs);
        if let Ok(hv) = HeaderValue::from_str(&value) {
            app = app.layer(SetResponseHeaderLayer::overriding(
                http::header::STRICT_TRANSPORT_SECURITY,
                hv,
            ));
        }
    }

    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    ));

    if !config.x_frame_options.is_empty() {
        if let Ok(hv) = HeaderValue::from_str(&config.x_frame_options) {
            app = app.layer(SetResponseHeaderLayer::if_not_present(
                http::header::X_FRAME_OPTIONS,
                hv,
            ));
        }
    }

    // Modern recommendation: disable the legacy browser XSS filter.
    app = app.layer(SetResponseHeaderLayer::if_not_present(
        http::header::X_XSS_PROTECTION,
        HeaderValue::from_static("0"),
    ));

    if !config.referrer_policy.is_empty() {
        if let Ok(hv) = HeaderValue::from_str(&config.referrer_policy) {
            app = app.layer(SetResponseHeaderLayer::if_not_present(
                http::header::REFERRER_POLICY,
                hv,
            ));
        }
    }

    app
}
