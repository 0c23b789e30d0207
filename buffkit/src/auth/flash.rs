//! One-time flash messages riding the session data map.
//!
//! Pushed by handlers after state changes and consumed on the next page
//! render (post-redirect-get). Messages live under a reserved key in the
//! session's data map, so any [`SessionStore`](super::SessionStore)
//! backend carries them.

use serde::{Deserialize, Serialize};

use super::session::SessionService;
use crate::error::Result;

const FLASH_KEY: &str = "_flash";

/// Flash message severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FlashKind {
    /// Something worked
    Success,
    /// Neutral information
    Info,
    /// Needs attention
    Warning,
    /// Something failed
    Error,
}

impl FlashKind {
    /// CSS class for templates.
    #[must_use]
    pub fn css_class(&self) -> &'static str {
        match self {
            Self::Success => "flash-success",
            Self::Info => "flash-info",
            Self::Warning => "flash-warning",
            Self::Error => "flash-error",
        }
    }
}

/// A single flash message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashMessage {
    /// Severity
    pub kind: FlashKind,
    /// Message text
    pub message: String,
}

impl FlashMessage {
    /// Success message.
    #[must_use]
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: FlashKind::Success,
            message: message.into(),
        }
    }

    /// Error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: FlashKind::Error,
            message: message.into(),
        }
    }

    /// Append this message to a session's pending flashes.
    pub async fn push(self, sessions: &SessionService, token: &str) -> Result<()> {
        let mut pending = take(sessions, token).await?;
        pending.push(self);
        sessions
            .store()
            .put_data(token, FLASH_KEY, serde_json::to_value(&pending).unwrap_or_default())
            .await
    }
}

/// Consume all pending flash messages for a session.
pub async fn take(sessions: &SessionService, token: &str) -> Result<Vec<FlashMessage>> {
    let value = sessions.store().take_data(token, FLASH_KEY).await?;
    Ok(value
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::{MemorySessions, MemoryUsers};
    use crate::auth::model::NewUser;
    use crate::auth::store::UserStore;
    use crate::config::SessionConfig;
    use std::collections::HashMap;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_push_and_consume() {
        let sessions = SessionService::new(
            Arc::new(MemorySessions::new()),
            SessionConfig::default(),
        );
        let users = MemoryUsers::new();
        let user = users
            .create(NewUser {
                email: "a@x.test".into(),
                password_digest: "$argon2id$x".into(),
                name: None,
                extra: HashMap::new(),
            })
            .await
            .unwrap();
        let session = sessions.issue(&user.id, None, None).await.unwrap();

        FlashMessage::success("Signed in")
            .push(&sessions, &session.token)
            .await
            .unwrap();
        FlashMessage::error("One more")
            .push(&sessions, &session.token)
            .await
            .unwrap();

        let messages = take(&sessions, &session.token).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message, "Signed in");
        assert_eq!(messages[1].kind, FlashKind::Error);

        // Consumed on read.
        assert!(take(&sessions, &session.token).await.unwrap().is_empty());
    }
}
