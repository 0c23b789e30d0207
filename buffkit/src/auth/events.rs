//! Auth event bus.
//!
//! Auth never calls other subsystems directly; it publishes events here
//! and interested parties (the mail subsystem, host code) subscribe. This
//! keeps the lifecycles decoupled in both directions.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// Events published by the authentication subsystem.
#[derive(Debug, Clone)]
pub enum AuthEvent {
    /// An account was created
    UserRegistered {
        /// Account id
        user_id: String,
        /// Account email
        email: String,
    },
    /// A login succeeded
    UserLoggedIn {
        /// Account id
        user_id: String,
        /// Account email
        email: String,
    },
    /// A session was destroyed by the user
    UserLoggedOut {
        /// Account id
        user_id: String,
    },
    /// The account hit the failed-attempt threshold and was locked
    AccountLocked {
        /// Account email
        email: String,
        /// When the lock expires
        until: DateTime<Utc>,
    },
    /// A password reset was requested
    PasswordResetRequested {
        /// Account id
        user_id: String,
        /// Account email
        email: String,
    },
}

/// Cloneable handle to the bus.
#[derive(Clone)]
pub struct AuthEvents {
    tx: broadcast::Sender<AuthEvent>,
}

impl AuthEvents {
    /// Create a bus with the given buffered capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Lossy by design: with no subscribers the event is
    /// discarded, and a lagging subscriber misses events rather than
    /// blocking auth.
    pub fn publish(&self, event: AuthEvent) {
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::trace!(subscribers = delivered, "auth event published");
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }
}

impl Default for AuthEvents {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let events = AuthEvents::default();
        let mut rx = events.subscribe();

        events.publish(AuthEvent::UserLoggedIn {
            user_id: "u1".into(),
            email: "a@x.test".into(),
        });

        match rx.recv().await.unwrap() {
            AuthEvent::UserLoggedIn { user_id, .. } => assert_eq!(user_id, "u1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let events = AuthEvents::default();
        events.publish(AuthEvent::UserLoggedOut {
            user_id: "u1".into(),
        });
    }
}
