//! Server-Sent Events support: a single-process fan-out broker for
//! server-rendered HTML fragments.
//!
//! The broker accepts broadcasts and delivers them to every connected
//! subscriber over long-lived `text/event-stream` responses. It is a
//! fan-out engine, not a message bus: there is no persistence, no replay
//! across disconnects, and no cross-process delivery.
//!
//! # Architecture
//!
//! A single coordinator task owns the subscriber set. Subscribe,
//! unsubscribe, and broadcast requests are commands on an internal channel,
//! so the set is only ever mutated serially. Each subscriber owns a bounded
//! delivery channel; a slow client whose channel fills has frames dropped
//! (and counted) rather than stalling the broker. A separate heartbeat task
//! emits an SSE comment on a timer to keep intermediaries from closing idle
//! connections.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use buffkit::sse::EventBroker;
//!
//! let broker = EventBroker::new(config.sse.clone());
//!
//! // From any handler or job:
//! broker.broadcast("update", "<div id=\"counter\">42</div>").await?;
//!
//! // HTMX side:
//! // <div hx-ext="sse" sse-connect="/events" sse-swap="update"></div>
//! ```
//!
//! # Shutdown
//!
//! [`EventBroker::shutdown`] is idempotent: it refuses new subscribers,
//! stops the heartbeat, waits for the coordinator to exit, and closes every
//! subscriber channel exactly once. Clients observe a clean end-of-stream.

mod broker;
mod event;
mod handler;

pub use broker::{BrokerStats, EventBroker, Subscriber, SubscriberId};
pub use event::{Delivery, Frame};
pub use handler::{sse_routes, sse_stream};

// Re-export the configuration section and axum's SSE types for convenience
pub use crate::config::SseConfig;
pub use axum::response::sse::{Event, Sse};
