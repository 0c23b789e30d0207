//! Session-based authentication.
//!
//! Provides password hashing, the session lifecycle, login/logout
//! endpoints, a require-login guard, rate limiting with account lockout,
//! and an audit trail -- all over pluggable stores so hosts choose
//! Postgres, memory, or their own backends per capability.
//!
//! # Stores
//!
//! Each concern is an explicit trait ([`UserStore`], [`SessionStore`],
//! [`LoginAttemptStore`], plus [`AuditStore`](crate::audit::AuditStore));
//! a host implements exactly the capabilities it has. The framework ships
//! Postgres implementations and in-memory ones for development and tests.
//!
//! # Login flow
//!
//! `POST /login` runs: rate-limit check (429 + `Retry-After` on deny),
//! user lookup, lock check, constant-time password verification (a dummy
//! digest is verified when the user is unknown, so timing does not reveal
//! account existence), session issue with a secure cookie, audit entry,
//! redirect. Failures increment a counter that locks the account at the
//! configured threshold.
//!
//! # Events
//!
//! Auth publishes [`AuthEvent`]s on an in-process bus instead of calling
//! into the mail subsystem directly; mail (or the host) subscribes.

mod device;
mod events;
pub mod flash;
mod handlers;
mod memory;
mod model;
mod password;
mod rate_limit;
mod session;
mod sql;
mod store;

pub use device::{DeviceStore, MemoryDevices, PgDevices, TrustedDevice};
pub use events::{AuthEvent, AuthEvents};
pub use flash::{FlashKind, FlashMessage};
pub use handlers::{
    auth_routes, load_session, require_login, AuthState, CurrentUser, SessionToken,
};
pub use memory::{MemoryLoginAttempts, MemorySessions, MemoryUsers};
pub use model::{LoginAttempt, NewUser, Session, User};
pub use password::PasswordHasher;
pub use rate_limit::{MemoryRateLimiter, RateDecision, RateLimiter, StoreRateLimiter};
pub use session::{parse_cookie, SessionService};
pub use sql::{PgLoginAttempts, PgSessions, PgUsers};
pub use store::{LoginAttemptStore, SessionStore, UserStore};
