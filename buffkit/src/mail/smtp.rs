//! SMTP delivery over lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::{Email, Mailer};
use crate::config::MailConfig;
use crate::error::{Error, Result};

/// [`Mailer`] backed by an async SMTP transport (STARTTLS relay).
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    /// Build the transport from configuration.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for an unusable relay host or from address;
    /// wiring surfaces this before the application starts.
    pub fn new(config: &MailConfig) -> Result<Self> {
        let from: Mailbox = config.from.parse().map_err(|e| {
            Error::Config(format!("mail.from '{}' is not a valid address: {e}", config.from))
        })?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| {
                Error::Config(format!(
                    "mail.smtp_host '{}' is not usable: {e}",
                    config.smtp_host
                ))
            })?
            .port(config.smtp_port);

        if let (Some(user), Some(password)) = (&config.smtp_user, &config.smtp_password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: Email) -> Result<()> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| Error::Mail(format!("invalid recipient '{}': {e}", email.to)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.html_body.clone())
            .map_err(|e| Error::Mail(format!("failed to build message: {e}")))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| Error::Mail(format!("SMTP delivery failed: {e}")))?;
        tracing::info!(to = %email.to, subject = %email.subject, "mail sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MailConfig {
        MailConfig {
            smtp_host: "smtp.example.test".into(),
            smtp_port: 587,
            smtp_user: Some("user".into()),
            smtp_password: Some("secret".into()),
            from: "no-reply@example.test".into(),
        }
    }

    #[test]
    fn test_construction_validates_from_address() {
        let mut bad = config();
        bad.from = "not an address".into();
        assert!(matches!(SmtpMailer::new(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn test_construction_with_valid_config() {
        assert!(SmtpMailer::new(&config()).is_ok());
    }
}
