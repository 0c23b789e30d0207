//! Development mailer: capture in memory, preview over HTTP.

use askama::Template;
use async_trait::async_trait;
use axum::{
    extract::State,
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::{Arc, Mutex};

use super::{Email, Mailer};
use crate::error::{Error, Result};

/// [`Mailer`] that stores every message instead of delivering it.
///
/// Wired in automatically when `dev_mode` is set; the captured messages
/// are listed at `GET /__mail/preview`.
#[derive(Default)]
pub struct DevMailer {
    messages: Mutex<Vec<Email>>,
}

impl DevMailer {
    /// Create an empty capture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of captured messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Email> {
        self.messages.lock().expect("dev mailer poisoned").clone()
    }

    /// Drop all captured messages.
    pub fn clear(&self) {
        self.messages.lock().expect("dev mailer poisoned").clear();
    }
}

#[async_trait]
impl Mailer for DevMailer {
    async fn send(&self, email: Email) -> Result<()> {
        tracing::info!(to = %email.to, subject = %email.subject, "mail captured (dev mode)");
        self.messages.lock().expect("dev mailer poisoned").push(email);
        Ok(())
    }
}

#[derive(Template)]
#[template(path = "mail_preview.html")]
struct MailPreviewPage {
    messages: Vec<Email>,
}

/// Routes for the dev-mode mail preview.
pub fn mail_preview_routes(mailer: Arc<DevMailer>) -> Router {
    Router::new()
        .route("/__mail/preview", get(preview))
        .with_state(mailer)
}

async fn preview(State(mailer): State<Arc<DevMailer>>) -> Response {
    let page = MailPreviewPage {
        messages: mailer.messages(),
    };
    match page.render() {
        Ok(body) => Html(body).into_response(),
        Err(e) => {
            tracing::error!("mail preview template failed: {e}");
            Error::Internal("template rendering failed".into()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_capture_and_preview() {
        let mailer = Arc::new(DevMailer::new());
        mailer
            .send(Email::html("a@x.test", "Hello there", "<p>Hi</p>"))
            .await
            .unwrap();
        assert_eq!(mailer.messages().len(), 1);

        let app = mail_preview_routes(mailer.clone());
        let response = app
            .oneshot(
                Request::get("/__mail/preview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("a@x.test"));
        assert!(text.contains("Hello there"));

        mailer.clear();
        assert!(mailer.messages().is_empty());
    }
}
