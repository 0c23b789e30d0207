//! Transactional mail.
//!
//! One [`Mailer`] trait with two implementations: SMTP over `lettre` for
//! real delivery, and an in-memory capture for development that exposes
//! its messages on `GET /__mail/preview`. Which one wiring picks follows
//! `dev_mode`.
//!
//! Mail reacts to auth events (welcome on registration, a notice on
//! lockout) through the event bus rather than being called by auth
//! directly; see [`spawn_mail_subscriber`].

mod dev;
mod smtp;

pub use dev::{mail_preview_routes, DevMailer};
pub use smtp::SmtpMailer;

use async_trait::async_trait;
use std::sync::Arc;

use crate::auth::{AuthEvent, AuthEvents};
use crate::error::Result;
use crate::templates::TemplateSource;

/// An outbound message.
#[derive(Debug, Clone)]
pub struct Email {
    /// Recipient address
    pub to: String,
    /// Subject line
    pub subject: String,
    /// HTML body
    pub html_body: String,
    /// Optional plain-text alternative
    pub text_body: Option<String>,
}

impl Email {
    /// Build an HTML email.
    #[must_use]
    pub fn html(
        to: impl Into<String>,
        subject: impl Into<String>,
        html_body: impl Into<String>,
    ) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            html_body: html_body.into(),
            text_body: None,
        }
    }

    /// Attach a plain-text alternative.
    #[must_use]
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_body = Some(text.into());
        self
    }
}

/// Something that can deliver an [`Email`].
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Deliver one message.
    async fn send(&self, email: Email) -> Result<()>;
}

/// Subscribe the mailer to auth events.
///
/// Runs until the event bus closes. Delivery failures log and continue;
/// losing a courtesy mail must never wedge the subscriber.
pub fn spawn_mail_subscriber(
    events: &AuthEvents,
    mailer: Arc<dyn Mailer>,
    templates: TemplateSource,
) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "mail subscriber lagged behind auth events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let email = match event {
                AuthEvent::UserRegistered { email, .. } => {
                    let body = templates
                        .lookup("mail/welcome.html")
                        .unwrap_or_else(|| "<p>Welcome!</p>".to_string());
                    Some(Email::html(email, "Welcome", body))
                }
                AuthEvent::AccountLocked { email, .. } => {
                    let body = templates
                        .lookup("mail/locked.html")
                        .unwrap_or_else(|| "<p>Your account was locked.</p>".to_string());
                    Some(Email::html(email, "Your account was locked", body))
                }
                AuthEvent::UserLoggedIn { .. }
                | AuthEvent::UserLoggedOut { .. }
                | AuthEvent::PasswordResetRequested { .. } => None,
            };

            if let Some(email) = email {
                if let Err(e) = mailer.send(email).await {
                    tracing::error!("event-driven mail failed: {e}");
                }
            }
        }
        tracing::debug!("mail subscriber exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_subscriber_sends_lockout_mail() {
        let events = AuthEvents::default();
        let mailer = Arc::new(DevMailer::new());
        let handle = spawn_mail_subscriber(&events, mailer.clone(), TemplateSource::embedded_only());

        events.publish(AuthEvent::AccountLocked {
            email: "a@x.test".into(),
            until: Utc::now(),
        });

        let mut delivered = false;
        for _ in 0..100 {
            if !mailer.messages().is_empty() {
                delivered = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(delivered);
        let messages = mailer.messages();
        assert_eq!(messages[0].to, "a@x.test");
        assert!(messages[0].subject.contains("locked"));

        handle.abort();
    }

    #[tokio::test]
    async fn test_subscriber_ignores_login_events() {
        let events = AuthEvents::default();
        let mailer = Arc::new(DevMailer::new());
        let handle = spawn_mail_subscriber(&events, mailer.clone(), TemplateSource::embedded_only());

        events.publish(AuthEvent::UserLoggedIn {
            user_id: "u1".into(),
            email: "a@x.test".into(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(mailer.messages().is_empty());

        handle.abort();
    }
}
