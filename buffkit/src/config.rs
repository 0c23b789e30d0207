//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence
//! (highest to lowest):
//! 1. Environment variables (prefix: BUFFKIT_)
//! 2. Current working directory: ./buffkit.toml
//! 3. Default values
//!
//! When buffkit is embedded in a host application, the host can also build a
//! [`Config`] directly and pass it to [`wire`](crate::kit::wire); nothing in
//! the framework reads the environment behind the caller's back.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Enable development conveniences (dev mailer, mail preview route)
    #[serde(default)]
    pub dev_mode: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON (structured) instead of human-readable
    #[serde(default)]
    pub log_json: bool,

    /// Secret used to protect session tokens and CSRF cookies.
    /// Required; wiring fails without it.
    #[serde(default)]
    pub session_secret: String,

    /// Shutdown deadline in seconds, shared by the broker and job runtime
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown_deadline_secs: u64,

    /// Database configuration (optional; stores fall back to memory)
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// SSE broker configuration
    #[serde(default)]
    pub sse: SseConfig,

    /// Background job configuration
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Mail configuration (optional; dev_mode captures instead)
    #[serde(default)]
    pub mail: Option<MailConfig>,

    /// Import-map configuration
    #[serde(default)]
    pub importmap: ImportMapConfig,

    /// Security middleware configuration
    #[serde(default)]
    pub security: SecurityConfig,

    /// Component expander configuration
    #[serde(default)]
    pub components: ComponentsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dev_mode: false,
            log_level: default_log_level(),
            log_json: false,
            session_secret: String::new(),
            shutdown_deadline_secs: default_shutdown_deadline(),
            database: None,
            session: SessionConfig::default(),
            auth: AuthConfig::default(),
            sse: SseConfig::default(),
            jobs: JobsConfig::default(),
            mail: None,
            importmap: ImportMapConfig::default(),
            security: SecurityConfig::default(),
            components: ComponentsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `./buffkit.toml` and `BUFFKIT_`-prefixed
    /// environment variables, on top of defaults.
    pub fn load() -> Result<Self> {
        Self::load_from("buffkit.toml")
    }

    /// Load configuration from a specific TOML file path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.into()))
            .merge(Env::prefixed("BUFFKIT_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate invariants that must hold before wiring proceeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a missing session secret, an
    /// unparseable database URL, or an empty SMTP host.
    pub fn validate(&self) -> Result<()> {
        if self.session_secret.is_empty() {
            return Err(Error::Config(
                "session_secret is required (set BUFFKIT_SESSION_SECRET)".into(),
            ));
        }
        if self.session_secret.len() < 32 {
            return Err(Error::Config(
                "session_secret must be at least 32 bytes".into(),
            ));
        }
        if let Some(db) = &self.database {
            if !db.url.starts_with("postgres://") && !db.url.starts_with("postgresql://") {
                return Err(Error::Config(format!(
                    "database.url must be a postgres:// URL, got '{}'",
                    crate::error::sanitize_url(&db.url)
                )));
            }
        }
        if let Some(mail) = &self.mail {
            if mail.smtp_host.is_empty() {
                return Err(Error::Config("mail.smtp_host must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Shutdown deadline as a [`Duration`].
    #[must_use]
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database connection URL
    pub url: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Maximum retry attempts for establishing the connection
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay between retry attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Directory holding the host's migration scripts
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Cookie name
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Session time-to-live in seconds
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Whether touching last-activity extends expiry.
    /// Off by default: sessions have a hard upper bound on lifetime.
    #[serde(default)]
    pub sliding: bool,

    /// Mark the cookie Secure (forced on when the request arrived over TLS)
    #[serde(default)]
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cookie_name: default_cookie_name(),
            ttl_secs: default_session_ttl(),
            sliding: false,
            secure: false,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Path of the login form / login POST
    #[serde(default = "default_login_path")]
    pub login_path: String,

    /// Where to redirect after a successful login
    #[serde(default = "default_after_login_path")]
    pub after_login_path: String,

    /// Where to redirect after logout
    #[serde(default = "default_after_logout_path")]
    pub after_logout_path: String,

    /// Failed attempts per email within the window before lockout
    #[serde(default = "default_max_per_email")]
    pub max_attempts_per_email: u32,

    /// Attempts per source IP within the window
    #[serde(default = "default_max_per_ip")]
    pub max_attempts_per_ip: u32,

    /// Sliding window length in seconds
    #[serde(default = "default_attempt_window")]
    pub attempt_window_secs: u64,

    /// Lockout duration in seconds once the per-email limit is exceeded
    #[serde(default = "default_lockout")]
    pub lockout_secs: u64,

    /// Minimum accepted password length
    #[serde(default = "default_min_password_length")]
    pub min_password_length: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            login_path: default_login_path(),
            after_login_path: default_after_login_path(),
            after_logout_path: default_after_logout_path(),
            max_attempts_per_email: default_max_per_email(),
            max_attempts_per_ip: default_max_per_ip(),
            attempt_window_secs: default_attempt_window(),
            lockout_secs: default_lockout(),
            min_password_length: default_min_password_length(),
        }
    }
}

impl AuthConfig {
    /// Sliding window as a [`Duration`].
    #[must_use]
    pub fn attempt_window(&self) -> Duration {
        Duration::from_secs(self.attempt_window_secs)
    }

    /// Lockout duration as a [`Duration`].
    #[must_use]
    pub fn lockout(&self) -> Duration {
        Duration::from_secs(self.lockout_secs)
    }
}

/// SSE broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SseConfig {
    /// Path the event stream is mounted on
    #[serde(default = "default_events_path")]
    pub path: String,

    /// Heartbeat cadence in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    /// Per-subscriber delivery channel capacity (frames)
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            path: default_events_path(),
            heartbeat_secs: default_heartbeat(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

impl SseConfig {
    /// Heartbeat cadence as a [`Duration`].
    #[must_use]
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

/// Background job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Number of worker tasks
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queue names in descending priority order
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Per-queue concurrency caps; queues absent from the map share the
    /// global worker bound
    #[serde(default)]
    pub queue_concurrency: std::collections::HashMap<String, usize>,

    /// Default retry budget when enqueue options leave it unset
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Default per-task timeout in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Backoff base in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Grace period handlers get to finish during shutdown, in seconds
    #[serde(default = "default_job_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queues: default_queues(),
            queue_concurrency: std::collections::HashMap::new(),
            retry_budget: default_retry_budget(),
            task_timeout_secs: default_task_timeout(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            shutdown_grace_secs: default_job_grace(),
        }
    }
}

/// Mail configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// SMTP relay host
    pub smtp_host: String,

    /// SMTP port
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// SMTP username (optional; unauthenticated relays exist in dev)
    #[serde(default)]
    pub smtp_user: Option<String>,

    /// SMTP password
    #[serde(default)]
    pub smtp_password: Option<String>,

    /// From address for framework-originated mail
    #[serde(default = "default_mail_from")]
    pub from: String,
}

/// Import-map configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportMapConfig {
    /// JSON file the pin set is persisted in
    #[serde(default = "default_importmap_file")]
    pub file: PathBuf,

    /// Directory vendored modules are written to
    #[serde(default = "default_vendor_dir")]
    pub vendor_dir: PathBuf,

    /// URL prefix vendored modules are served under
    #[serde(default = "default_vendor_prefix")]
    pub vendor_prefix: String,
}

impl Default for ImportMapConfig {
    fn default() -> Self {
        Self {
            file: default_importmap_file(),
            vendor_dir: default_vendor_dir(),
            vendor_prefix: default_vendor_prefix(),
        }
    }
}

/// Security middleware configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Master switch for response headers
    #[serde(default = "default_true")]
    pub headers_enabled: bool,

    /// Send HSTS (only applied when TLS is active)
    #[serde(default = "default_true")]
    pub hsts: bool,

    /// HSTS max-age in seconds
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,

    /// X-Frame-Options value ("" disables)
    #[serde(default = "default_frame_options")]
    pub x_frame_options: String,

    /// Referrer-Policy value ("" disables)
    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,

    /// Whether the service is behind TLS (controls HSTS and Secure cookies)
    #[serde(default)]
    pub tls_enabled: bool,

    /// Enable CSRF token validation on state-changing methods
    #[serde(default = "default_true")]
    pub csrf_enabled: bool,

    /// CSRF cookie name
    #[serde(default = "default_csrf_cookie")]
    pub csrf_cookie_name: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            headers_enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age(),
            x_frame_options: default_frame_options(),
            referrer_policy: default_referrer_policy(),
            tls_enabled: false,
            csrf_enabled: true,
            csrf_cookie_name: default_csrf_cookie(),
        }
    }
}

/// Component expander configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentsConfig {
    /// Reserved tag prefix
    #[serde(default = "default_component_prefix")]
    pub prefix: String,

    /// Register the built-in component set at wiring
    #[serde(default = "default_true")]
    pub register_defaults: bool,
}

impl Default for ComponentsConfig {
    fn default() -> Self {
        Self {
            prefix: default_component_prefix(),
            register_defaults: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_deadline() -> u64 {
    10
}

fn default_max_connections() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    2
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_cookie_name() -> String {
    "session".to_string()
}

fn default_session_ttl() -> u64 {
    60 * 60 * 24 * 14
}

fn default_login_path() -> String {
    "/login".to_string()
}

fn default_after_login_path() -> String {
    "/".to_string()
}

fn default_after_logout_path() -> String {
    "/login".to_string()
}

fn default_max_per_email() -> u32 {
    5
}

fn default_max_per_ip() -> u32 {
    20
}

fn default_attempt_window() -> u64 {
    15 * 60
}

fn default_lockout() -> u64 {
    30 * 60
}

fn default_min_password_length() -> usize {
    8
}

fn default_events_path() -> String {
    "/events".to_string()
}

fn default_heartbeat() -> u64 {
    25
}

fn default_subscriber_buffer() -> usize {
    64
}

fn default_workers() -> usize {
    4
}

fn default_queues() -> Vec<String> {
    vec![
        "critical".to_string(),
        "default".to_string(),
        "low".to_string(),
    ]
}

fn default_retry_budget() -> u32 {
    3
}

fn default_task_timeout() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    10 * 60 * 1000
}

fn default_job_grace() -> u64 {
    15
}

fn default_smtp_port() -> u16 {
    587
}

fn default_mail_from() -> String {
    "no-reply@localhost".to_string()
}

fn default_importmap_file() -> PathBuf {
    PathBuf::from("config/importmap.json")
}

fn default_vendor_dir() -> PathBuf {
    PathBuf::from("public/assets/vendor")
}

fn default_vendor_prefix() -> String {
    "/assets/vendor".to_string()
}

fn default_true() -> bool {
    true
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

fn default_frame_options() -> String {
    "DENY".to_string()
}

fn default_referrer_policy() -> String {
    "strict-origin-when-cross-origin".to_string()
}

fn default_csrf_cookie() -> String {
    "_csrf".to_string()
}

fn default_component_prefix() -> String {
    "bk-".to_string()
}
