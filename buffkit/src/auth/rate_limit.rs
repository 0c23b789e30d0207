//! Login rate limiting
//!
//! Tracks login attempts per email and per source address against a
//! sliding window, and locks an identity out once it crosses the
//! threshold. Two variants: an in-process limiter for single instances,
//! and a store-backed limiter that counts rows in a
//! [`LoginAttemptStore`] so multiple instances share state.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use super::model::LoginAttempt;
use super::store::LoginAttemptStore;
use crate::config::AuthConfig;
use crate::error::{Result, ThrottleReason};

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Proceed with authentication
    Allow,
    /// Refuse with 429 and a `Retry-After`
    Deny {
        /// Which limit tripped
        reason: ThrottleReason,
        /// Seconds until the caller may retry
        retry_after_secs: u64,
    },
}

impl RateDecision {
    /// Whether this decision allows the attempt.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Rate-limit policy over (email, source IP) pairs.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Check without recording anything.
    async fn check(&self, email: &str, ip: &str) -> Result<RateDecision>;

    /// Record a failed attempt.
    async fn record_failure(&self, email: &str, ip: &str) -> Result<()>;

    /// Record a success; clears the email's window and any lock on it.
    async fn record_success(&self, email: &str, ip: &str) -> Result<()>;
}

/// In-process limiter backed by concurrent maps. Suitable for single
/// instances; state is lost on restart (the account lock on the user
/// record itself survives, see the login algorithm).
pub struct MemoryRateLimiter {
    config: AuthConfig,
    email_failures: DashMap<String, Vec<DateTime<Utc>>>,
    ip_attempts: DashMap<String, Vec<DateTime<Utc>>>,
    locks: DashMap<String, DateTime<Utc>>,
}

impl MemoryRateLimiter {
    /// Create a limiter with the given policy.
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            email_failures: DashMap::new(),
            ip_attempts: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::seconds(self.config.attempt_window_secs as i64)
    }

    fn active_lock(&self, key: &str, now: DateTime<Utc>) -> Option<u64> {
        // Copy out before mutating; holding a map guard across remove()
        // would deadlock on the shard.
        let until = self.locks.get(key).map(|entry| *entry)?;
        if until > now {
            Some((until - now).num_seconds().max(1) as u64)
        } else {
            self.locks.remove(key);
            None
        }
    }

    fn lock(&self, key: String, now: DateTime<Utc>) {
        let until = now + Duration::seconds(self.config.lockout_secs as i64);
        self.locks.insert(key, until);
    }

    fn trimmed_count(
        map: &DashMap<String, Vec<DateTime<Utc>>>,
        key: &str,
        window_start: DateTime<Utc>,
    ) -> u32 {
        match map.get_mut(key) {
            Some(mut entry) => {
                entry.retain(|at| *at >= window_start);
                entry.len() as u32
            }
            None => 0,
        }
    }

    /// Drop entries that are entirely outside the window and expired
    /// locks. Called by the periodic cleanup job; queries also trim the
    /// entries they touch.
    pub fn cleanup(&self) {
        let now = Utc::now();
        let window_start = self.window_start(now);
        self.email_failures
            .retain(|_, attempts| attempts.iter().any(|at| *at >= window_start));
        self.ip_attempts
            .retain(|_, attempts| attempts.iter().any(|at| *at >= window_start));
        self.locks.retain(|_, until| *until > now);
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, email: &str, ip: &str) -> Result<RateDecision> {
        let email = email.to_lowercase();
        let now = Utc::now();
        let window_start = self.window_start(now);

        if let Some(remaining) = self.active_lock(&format!("email:{email}"), now) {
            return Ok(RateDecision::Deny {
                reason: ThrottleReason::Locked,
                retry_after_secs: remaining,
            });
        }
        if let Some(remaining) = self.active_lock(&format!("ip:{ip}"), now) {
            return Ok(RateDecision::Deny {
                reason: ThrottleReason::SourceIp,
                retry_after_secs: remaining,
            });
        }

        if Self::trimmed_count(&self.email_failures, &email, window_start)
            >= self.config.max_attempts_per_email
        {
            self.lock(format!("email:{email}"), now);
            return Ok(RateDecision::Deny {
                reason: ThrottleReason::Account,
                retry_after_secs: self.config.lockout_secs,
            });
        }

        if Self::trimmed_count(&self.ip_attempts, ip, window_start)
            >= self.config.max_attempts_per_ip
        {
            self.lock(format!("ip:{ip}"), now);
            return Ok(RateDecision::Deny {
                reason: ThrottleReason::SourceIp,
                retry_after_secs: self.config.lockout_secs,
            });
        }

        Ok(RateDecision::Allow)
    }

    async fn record_failure(&self, email: &str, ip: &str) -> Result<()> {
        let email = email.to_lowercase();
        let now = Utc::now();

        self.email_failures.entry(email.clone()).or_default().push(now);
        self.ip_attempts.entry(ip.to_string()).or_default().push(now);

        // Crossing the threshold locks the identity immediately, so the
        // next check reports "account temporarily locked" rather than
        // re-deriving the window count.
        let window_start = self.window_start(now);
        if Self::trimmed_count(&self.email_failures, &email, window_start)
            >= self.config.max_attempts_per_email
        {
            self.lock(format!("email:{email}"), now);
        }
        if Self::trimmed_count(&self.ip_attempts, ip, window_start)
            >= self.config.max_attempts_per_ip
        {
            self.lock(format!("ip:{ip}"), now);
        }
        Ok(())
    }

    async fn record_success(&self, email: &str, ip: &str) -> Result<()> {
        let email = email.to_lowercase();
        self.email_failures.remove(&email);
        self.locks.remove(&format!("email:{email}"));
        // Successful logins still count toward the IP window.
        self.ip_attempts
            .entry(ip.to_string())
            .or_default()
            .push(Utc::now());
        Ok(())
    }
}

/// Store-backed limiter: every attempt is a row, counts are window
/// queries. Lock state rides the user record (`locked_until`), which the
/// login algorithm checks separately; this limiter covers the windows.
pub struct StoreRateLimiter {
    config: AuthConfig,
    attempts: Arc<dyn LoginAttemptStore>,
}

impl StoreRateLimiter {
    /// Create a limiter over an attempt store.
    #[must_use]
    pub fn new(config: AuthConfig, attempts: Arc<dyn LoginAttemptStore>) -> Self {
        Self { config, attempts }
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn check(&self, email: &str, ip: &str) -> Result<RateDecision> {
        let since = Utc::now() - Duration::seconds(self.config.attempt_window_secs as i64);

        if self.attempts.count_for_email_since(email, since).await?
            >= self.config.max_attempts_per_email
        {
            return Ok(RateDecision::Deny {
                reason: ThrottleReason::Account,
                retry_after_secs: self.config.lockout_secs,
            });
        }
        if self.attempts.count_for_ip_since(ip, since).await? >= self.config.max_attempts_per_ip {
            return Ok(RateDecision::Deny {
                reason: ThrottleReason::SourceIp,
                retry_after_secs: self.config.lockout_secs,
            });
        }
        Ok(RateDecision::Allow)
    }

    async fn record_failure(&self, email: &str, ip: &str) -> Result<()> {
        self.attempts
            .record(LoginAttempt {
                email: email.to_lowercase(),
                ip: ip.to_string(),
                success: false,
                at: Utc::now(),
            })
            .await
    }

    async fn record_success(&self, email: &str, ip: &str) -> Result<()> {
        self.attempts
            .record(LoginAttempt {
                email: email.to_lowercase(),
                ip: ip.to_string(),
                success: true,
                at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::memory::MemoryLoginAttempts;

    fn policy() -> AuthConfig {
        AuthConfig {
            max_attempts_per_email: 5,
            max_attempts_per_ip: 20,
            attempt_window_secs: 900,
            lockout_secs: 1800,
            ..AuthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_allows_under_threshold() {
        let limiter = MemoryRateLimiter::new(policy());
        for _ in 0..4 {
            limiter.record_failure("a@x.test", "1.1.1.1").await.unwrap();
        }
        assert!(limiter.check("a@x.test", "1.1.1.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_fifth_failure_locks_the_account() {
        let limiter = MemoryRateLimiter::new(policy());
        for _ in 0..5 {
            assert!(limiter.check("a@x.test", "1.1.1.1").await.unwrap().is_allowed());
            limiter.record_failure("a@x.test", "1.1.1.1").await.unwrap();
        }

        // Sixth check inside the window: locked, with a sane Retry-After.
        match limiter.check("a@x.test", "1.1.1.1").await.unwrap() {
            RateDecision::Deny {
                reason,
                retry_after_secs,
            } => {
                assert_eq!(reason, ThrottleReason::Locked);
                assert!((1..=1800).contains(&retry_after_secs));
            }
            RateDecision::Allow => panic!("expected deny"),
        }
    }

    #[tokio::test]
    async fn test_email_is_case_insensitive() {
        let limiter = MemoryRateLimiter::new(policy());
        for _ in 0..5 {
            limiter.record_failure("A@X.TEST", "1.1.1.1").await.unwrap();
        }
        assert!(!limiter.check("a@x.test", "2.2.2.2").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_ip_limit_independent_of_email() {
        let config = AuthConfig {
            max_attempts_per_ip: 3,
            ..policy()
        };
        let limiter = MemoryRateLimiter::new(config);
        for i in 0..3 {
            limiter
                .record_failure(&format!("u{i}@x.test"), "9.9.9.9")
                .await
                .unwrap();
        }
        match limiter.check("fresh@x.test", "9.9.9.9").await.unwrap() {
            RateDecision::Deny { reason, .. } => assert_eq!(reason, ThrottleReason::SourceIp),
            RateDecision::Allow => panic!("expected deny"),
        }
        // A different address is unaffected.
        assert!(limiter
            .check("fresh@x.test", "8.8.8.8")
            .await
            .unwrap()
            .is_allowed());
    }

    #[tokio::test]
    async fn test_success_clears_email_state() {
        let limiter = MemoryRateLimiter::new(policy());
        for _ in 0..5 {
            limiter.record_failure("a@x.test", "1.1.1.1").await.unwrap();
        }
        limiter.record_success("a@x.test", "1.1.1.1").await.unwrap();
        assert!(limiter.check("a@x.test", "1.1.1.1").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_cleanup_drops_expired_state() {
        let limiter = MemoryRateLimiter::new(AuthConfig {
            attempt_window_secs: 0,
            ..policy()
        });
        limiter.record_failure("a@x.test", "1.1.1.1").await.unwrap();
        limiter.cleanup();
        assert!(limiter.email_failures.is_empty());
        assert!(limiter.ip_attempts.is_empty());
    }

    #[tokio::test]
    async fn test_store_backed_limiter() {
        let attempts = Arc::new(MemoryLoginAttempts::new());
        let limiter = StoreRateLimiter::new(policy(), attempts);

        for _ in 0..5 {
            limiter.record_failure("a@x.test", "1.1.1.1").await.unwrap();
        }
        match limiter.check("a@x.test", "2.2.2.2").await.unwrap() {
            RateDecision::Deny { reason, .. } => assert_eq!(reason, ThrottleReason::Account),
            RateDecision::Allow => panic!("expected deny"),
        }
    }
}
