//! Wiring: compose every subsystem into a host router and hand back the
//! `Kit` of handles.

use axum::Router;
use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::audit::{AuditStore, MemoryAuditLog, PgAuditLog};
use crate::auth::{
    auth_routes, load_session, AuthEvents, AuthState, DeviceStore, LoginAttemptStore,
    MemoryDevices, MemoryLoginAttempts, MemoryRateLimiter, MemorySessions, MemoryUsers,
    PasswordHasher, PgDevices, PgLoginAttempts, PgSessions, PgUsers, RateLimiter, SessionService,
    StoreRateLimiter, UserStore,
};
use crate::components::{expand_middleware, register_defaults, ComponentRegistry};
use crate::config::Config;
use crate::error::Result;
use crate::importmap::ImportMapManager;
use crate::jobs::{JobClient, JobRuntime, MemoryQueue};
use crate::mail::{mail_preview_routes, spawn_mail_subscriber, DevMailer, Mailer, SmtpMailer};
use crate::secure::{apply_security_headers, csrf_middleware};
use crate::sse::{sse_routes, EventBroker};
use crate::templates::TemplateSource;

/// Handles to every wired subsystem. One `Kit` per application; clone the
/// `Arc` freely into handlers and jobs.
pub struct Kit {
    /// The configuration wiring ran with
    pub config: Config,
    /// Database pool, when configured
    pub db: Option<PgPool>,
    /// SSE broker
    pub broker: Arc<EventBroker>,
    /// Component registry
    pub components: Arc<ComponentRegistry>,
    /// Job runtime (workers start via [`JobRuntime::start`] or the CLI)
    pub jobs: Arc<JobRuntime>,
    /// Mail sender (SMTP, or the dev capture in dev mode)
    pub mailer: Arc<dyn Mailer>,
    /// The dev capture, when wired (dev mode or no SMTP configured)
    pub dev_mailer: Option<Arc<DevMailer>>,
    /// Import-map manager
    pub import_maps: Arc<ImportMapManager>,
    /// Session service
    pub sessions: Arc<SessionService>,
    /// User store
    pub users: Arc<dyn UserStore>,
    /// Audit trail
    pub audit: Arc<dyn AuditStore>,
    /// Login-attempt store
    pub attempts: Arc<dyn LoginAttemptStore>,
    /// Trusted-device store
    pub devices: Arc<dyn DeviceStore>,
    /// Auth event bus
    pub events: AuthEvents,
    /// Template lookup (disk overrides + embedded defaults)
    pub templates: TemplateSource,
    /// State bundle for [`require_login`](crate::auth::require_login)
    /// guards on host routes
    pub auth_state: AuthState,

    mail_task: Mutex<Option<JoinHandle<()>>>,
    finished: AtomicBool,
}

impl Kit {
    /// Enqueue handle for the job runtime.
    #[must_use]
    pub fn jobs_client(&self) -> JobClient {
        self.jobs.client()
    }

    /// Stop the broker and job runtime, and release shared resources.
    ///
    /// Idempotent; bounded by the configured shutdown deadline per
    /// component. Existing HTTP connections observe end-of-stream; new
    /// subscribes and enqueues fail fast with a shutdown error.
    pub async fn shutdown(&self) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("buffkit shutting down");

        self.broker.shutdown(self.config.shutdown_deadline()).await;
        self.jobs.shutdown().await;

        if let Some(task) = self.mail_task.lock().expect("mail task poisoned").take() {
            task.abort();
        }
        if let Some(db) = &self.db {
            db.close().await;
        }
        tracing::info!("buffkit shut down");
    }
}

/// Compose buffkit into a host router.
///
/// Validates configuration, builds every subsystem, mounts the framework
/// routes (login, logout, events, and the dev mail preview), and installs
/// the middleware chain: security headers, CSRF, session loading, then --
/// closest to the handlers -- the component expander, so it sees final
/// handler output.
///
/// # Errors
///
/// Configuration failures (missing session secret, bad database URL,
/// unusable SMTP host) and connection failures are returned before any
/// background task starts; no partial system is left running.
pub async fn wire(router: Router, config: Config) -> Result<(Router, Arc<Kit>)> {
    config.validate()?;

    let db = match &config.database {
        Some(db_config) => Some(crate::database::create_pool(db_config).await?),
        None => None,
    };

    // Stores: Postgres when a pool exists, memory otherwise.
    let users: Arc<dyn UserStore> = match &db {
        Some(pool) => Arc::new(PgUsers::new(pool.clone())),
        None => Arc::new(MemoryUsers::new()),
    };
    let audit: Arc<dyn AuditStore> = match &db {
        Some(pool) => Arc::new(PgAuditLog::new(pool.clone())),
        None => Arc::new(MemoryAuditLog::new()),
    };
    let attempts: Arc<dyn LoginAttemptStore> = match &db {
        Some(pool) => Arc::new(PgLoginAttempts::new(pool.clone())),
        None => Arc::new(MemoryLoginAttempts::new()),
    };
    let sessions = Arc::new(SessionService::new(
        match &db {
            Some(pool) => Arc::new(PgSessions::new(pool.clone())),
            None => Arc::new(MemorySessions::new()),
        },
        config.session.clone(),
    ));
    let devices: Arc<dyn DeviceStore> = match &db {
        Some(pool) => Arc::new(PgDevices::new(pool.clone())),
        None => Arc::new(MemoryDevices::new()),
    };
    // With shared storage the limiter can be shared too; single instances
    // keep the cheaper in-process windows. The concrete handle sticks
    // around so the cleanup job can trim its maps.
    let mut memory_limiter: Option<Arc<MemoryRateLimiter>> = None;
    let limiter: Arc<dyn RateLimiter> = match &db {
        Some(_) => Arc::new(StoreRateLimiter::new(config.auth.clone(), attempts.clone())),
        None => {
            let limiter = Arc::new(MemoryRateLimiter::new(config.auth.clone()));
            memory_limiter = Some(limiter.clone());
            limiter
        }
    };

    let hasher = Arc::new(PasswordHasher::new(config.auth.min_password_length));
    let events = AuthEvents::default();
    let templates = TemplateSource::with_overrides("templates");

    let broker = Arc::new(EventBroker::new(config.sse.clone()));

    let components = Arc::new(ComponentRegistry::new(config.components.prefix.clone()));
    if config.components.register_defaults {
        register_defaults(&components)?;
    }

    let jobs = Arc::new(JobRuntime::new(
        Arc::new(MemoryQueue::new()),
        config.jobs.clone(),
    ));
    register_maintenance_handlers(&jobs, &sessions, &users, &audit, &attempts, memory_limiter, &config);

    let (mailer, dev_mailer): (Arc<dyn Mailer>, Option<Arc<DevMailer>>) = if config.dev_mode {
        let dev = Arc::new(DevMailer::new());
        (dev.clone(), Some(dev))
    } else if let Some(mail_config) = &config.mail {
        (Arc::new(SmtpMailer::new(mail_config)?), None)
    } else {
        tracing::warn!("no mail configuration; capturing mail in memory");
        let dev = Arc::new(DevMailer::new());
        (dev.clone(), Some(dev))
    };
    let mail_task = spawn_mail_subscriber(&events, mailer.clone(), templates.clone());

    let import_maps = Arc::new(ImportMapManager::load(config.importmap.clone())?);

    let auth_state = AuthState {
        users: users.clone(),
        sessions: sessions.clone(),
        limiter,
        hasher,
        audit: audit.clone(),
        events: events.clone(),
        config: config.auth.clone(),
        security: Arc::new(config.security.clone()),
    };

    // Framework routes join the host's.
    let mut app = router
        .merge(auth_routes(auth_state.clone()))
        .merge(sse_routes(broker.clone(), &config.sse.path));
    if config.dev_mode {
        if let Some(dev) = &dev_mailer {
            app = app.merge(mail_preview_routes(dev.clone()));
        }
    }

    // Middleware chain; the first layer added sits closest to the
    // handlers, so the expander observes handler output and the security
    // headers wrap everything.
    app = app.layer(axum::middleware::from_fn_with_state(
        components.clone(),
        expand_middleware,
    ));
    app = app.layer(axum::middleware::from_fn_with_state(
        auth_state.clone(),
        load_session,
    ));
    app = app.layer(axum::middleware::from_fn_with_state(
        auth_state.security.clone(),
        csrf_middleware,
    ));
    app = apply_security_headers(app, &config.security);
    app = app.layer(tower_http::trace::TraceLayer::new_for_http());
    // A panicking handler becomes a 500, never a dropped connection.
    app = app.layer(tower_http::catch_panic::CatchPanicLayer::new());

    let kit = Arc::new(Kit {
        db,
        broker,
        components,
        jobs,
        mailer,
        dev_mailer,
        import_maps,
        sessions,
        users,
        audit,
        attempts,
        devices,
        events,
        templates,
        auth_state,
        config,
        mail_task: Mutex::new(Some(mail_task)),
        finished: AtomicBool::new(false),
    });

    tracing::info!("buffkit wired");
    Ok((app, kit))
}

/// Default handlers for the scheduler's standard periodic kinds. Hosts
/// override any of them by registering the kind again.
fn register_maintenance_handlers(
    jobs: &JobRuntime,
    sessions: &Arc<SessionService>,
    users: &Arc<dyn UserStore>,
    audit: &Arc<dyn AuditStore>,
    attempts: &Arc<dyn LoginAttemptStore>,
    memory_limiter: Option<Arc<MemoryRateLimiter>>,
    config: &Config,
) {
    let purge_sessions = sessions.clone();
    let prune_attempts = attempts.clone();
    let attempt_window = config.auth.attempt_window_secs;
    jobs.register_fn("auth:cleanup_sessions", move |_ctx, _task| {
        let sessions = purge_sessions.clone();
        let attempts = prune_attempts.clone();
        let limiter = memory_limiter.clone();
        async move {
            let purged = sessions
                .purge_expired()
                .await
                .map_err(|e| crate::jobs::JobError::failed(e.to_string()))?;
            let cutoff =
                chrono::Utc::now() - chrono::Duration::seconds(attempt_window as i64 * 2);
            let pruned = attempts
                .prune_before(cutoff)
                .await
                .map_err(|e| crate::jobs::JobError::failed(e.to_string()))?;
            if let Some(limiter) = limiter {
                limiter.cleanup();
            }
            tracing::info!(purged, pruned, "session and attempt cleanup ran");
            Ok(())
        }
    });

    let unlock_users = users.clone();
    jobs.register_fn("auth:unlock_accounts", move |_ctx, _task| {
        let users = unlock_users.clone();
        async move {
            let unlocked = users
                .unlock_expired(chrono::Utc::now())
                .await
                .map_err(|e| crate::jobs::JobError::failed(e.to_string()))?;
            if unlocked > 0 {
                tracing::info!(unlocked, "expired account locks cleared");
            }
            Ok(())
        }
    });

    let prune_audit = audit.clone();
    jobs.register_fn("audit:cleanup", move |_ctx, _task| {
        let audit = prune_audit.clone();
        async move {
            let cutoff = chrono::Utc::now() - chrono::Duration::days(90);
            let pruned = audit
                .prune_before(cutoff)
                .await
                .map_err(|e| crate::jobs::JobError::failed(e.to_string()))?;
            tracing::info!(pruned, "audit log pruned");
            Ok(())
        }
    });

    // Policy-dependent kinds: the framework schedules them, hosts decide
    // what they mean by re-registering.
    jobs.register_fn("auth:password_expiry", |_ctx, _task| async {
        tracing::debug!("password expiry check: no host handler registered");
        Ok(())
    });
    jobs.register_fn("auth:notify_inactive", |_ctx, _task| async {
        tracing::debug!("inactive-user notification: no host handler registered");
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::response::Html;
    use axum::routing::get;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_config(dev_mode: bool) -> Config {
        let dir = tempfile::tempdir().unwrap().keep();
        Config {
            dev_mode,
            session_secret: "0123456789abcdef0123456789abcdef".to_string(),
            importmap: crate::config::ImportMapConfig {
                file: dir.join("importmap.json"),
                vendor_dir: dir.join("vendor"),
                vendor_prefix: "/assets/vendor".to_string(),
            },
            ..Config::default()
        }
    }

    fn host_router() -> Router {
        Router::new().route(
            "/page",
            get(|| async {
                Html("<html><body><bk-button variant=\"primary\">Go</bk-button></body></html>")
            }),
        )
    }

    #[tokio::test]
    async fn test_wire_requires_session_secret() {
        let config = Config::default();
        assert!(wire(Router::new(), config).await.is_err());
    }

    #[tokio::test]
    async fn test_wire_mounts_login_and_events() {
        let (app, kit) = wire(host_router(), test_config(false)).await.unwrap();

        let response = app
            .clone()
            .oneshot(Request::get("/login").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::get("/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_TYPE)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        kit.shutdown().await;
    }

    #[tokio::test]
    async fn test_mail_preview_only_in_dev_mode() {
        let (prod, kit_prod) = wire(Router::new(), test_config(false)).await.unwrap();
        let response = prod
            .oneshot(
                Request::get("/__mail/preview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        kit_prod.shutdown().await;

        let (dev, kit_dev) = wire(Router::new(), test_config(true)).await.unwrap();
        let response = dev
            .oneshot(
                Request::get("/__mail/preview")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        kit_dev.shutdown().await;
    }

    #[tokio::test]
    async fn test_html_responses_are_expanded_through_the_stack() {
        let (app, kit) = wire(host_router(), test_config(false)).await.unwrap();

        let response = app
            .oneshot(Request::get("/page").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        // Security headers applied on the way out.
        assert_eq!(
            response.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("btn btn-primary"));
        assert!(!text.contains("<bk-button"));

        kit.shutdown().await;
    }

    #[tokio::test]
    async fn test_kit_shutdown_is_idempotent_and_stops_subsystems() {
        let (_app, kit) = wire(Router::new(), test_config(false)).await.unwrap();

        kit.shutdown().await;
        kit.shutdown().await;

        assert!(kit.broker.subscribe().await.is_err());
        assert!(kit
            .jobs_client()
            .enqueue(
                "x",
                serde_json::Value::Null,
                crate::jobs::EnqueueOptions::default()
            )
            .await
            .is_err());
    }
}
