//! Event frames and their wire encoding.

use axum::response::sse::Event;

/// One event delivery: an event kind plus HTML payload.
///
/// The broker stamps each frame with a monotonically increasing id. The id
/// orders frames within a subscriber; it is not emitted on the wire (no
/// `id:` field, so browsers do not attempt resume against this core).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Broker-assigned monotonic sequence number
    pub id: u64,
    /// Event kind, free-form (matches `sse-swap` names on the client)
    pub kind: String,
    /// Payload bytes, usually an HTML fragment
    pub data: String,
}

impl Frame {
    /// Encode this frame in SSE wire format.
    ///
    /// The payload is split on newlines into one `data:` line each --
    /// never on any other byte -- and the frame is terminated by a blank
    /// line.
    #[must_use]
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(self.kind.len() + self.data.len() + 16);
        out.push_str("event: ");
        out.push_str(&self.kind);
        out.push('\n');
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        out
    }

    /// Convert to an axum SSE [`Event`].
    #[must_use]
    pub fn into_event(self) -> Event {
        Event::default().event(self.kind).data(self.data)
    }
}

/// What a subscriber receives on its delivery channel.
#[derive(Debug, Clone)]
pub enum Delivery {
    /// A broadcast frame
    Frame(Frame),
    /// A keep-alive; rendered as the `: heartbeat` comment
    Heartbeat,
}

impl Delivery {
    /// Convert to an axum SSE [`Event`].
    #[must_use]
    pub fn into_event(self) -> Event {
        match self {
            Self::Frame(frame) => frame.into_event(),
            Self::Heartbeat => Event::default().comment("heartbeat"),
        }
    }
}
