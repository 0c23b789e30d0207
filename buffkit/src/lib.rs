//! # buffkit
//!
//! An opinionated server-side-rendered toolkit for axum applications.
//! One [`wire`](kit::wire) call layers seven cooperating subsystems onto a
//! host router and returns a [`Kit`](kit::Kit) of handles:
//!
//! - **SSE broker**: single-process fan-out of HTML fragments to
//!   connected clients, with heartbeats and graceful shutdown
//! - **Components**: register `<bk-*>` renderers; outgoing HTML is
//!   expanded server-side, slots and attributes included
//! - **Authentication**: argon2 passwords, cookie sessions, login
//!   lockout, rate limiting, audit trail, pluggable stores
//! - **Jobs**: priority queues, retries with backoff, dead letters,
//!   cron scheduling, bounded workers
//! - **Mail**: SMTP sender with an in-memory dev capture and preview page
//! - **Import maps**: pin browser modules, vendor them with integrity
//!   hashes, render the map tag
//! - **Security**: response headers and CSRF validation
//!
//! ## Example
//!
//! ```rust,no_run
//! use axum::{routing::get, Router};
//! use buffkit::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> buffkit::error::Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config);
//!
//!     let app = Router::new().route("/", get(|| async { "hello" }));
//!     let (app, kit) = buffkit::wire(app, config).await?;
//!
//!     kit.jobs.start(0);
//!     kit.broker.broadcast("update", "<div>ready</div>").await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     axum::serve(listener, app).await?;
//!     kit.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! There is no ORM, no bundler, and no client framework in here; the
//! browser gets server-rendered HTML, import-mapped ES modules, and an
//! event stream.

#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod components;
pub mod config;
pub mod database;
pub mod error;
pub mod importmap;
pub mod jobs;
pub mod kit;
pub mod mail;
pub mod migrate;
pub mod observability;
pub mod secure;
pub mod sse;
pub mod templates;

pub use kit::{wire, Kit};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::audit::{AuditEntry, AuditKind, AuditStatus, AuditStore};
    pub use crate::auth::{
        require_login, AuthEvent, AuthEvents, CurrentUser, PasswordHasher, SessionService,
        UserStore,
    };
    pub use crate::components::{ComponentRegistry, Renderer};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::importmap::ImportMapManager;
    pub use crate::jobs::{EnqueueOptions, JobClient, JobError, JobRuntime, Scheduler};
    pub use crate::kit::{wire, Kit};
    pub use crate::mail::{Email, Mailer};
    pub use crate::observability::init_tracing;
    pub use crate::sse::EventBroker;
}
