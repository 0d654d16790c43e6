//! Connection lifecycle events
//!
//! Connections report their lifecycle to the owning server as typed messages
//! on a single per-server channel. The server forwards each event to the
//! application and reaps the connection from its registry on `Closed`.

use bytes::Bytes;
use std::fmt;

/// Stable identifier for a connection within one server instance.
///
/// Ids are allocated from a monotonically increasing counter and never
/// reused, so "is this id still in the registry" is a reliable liveness
/// test. Handles given to the application carry this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection (EOF on read)
    Peer,
    /// No activity within the configured timeout
    Timeout,
    /// The server was shut down
    Shutdown,
    /// An I/O or handshake error terminated the connection
    Error,
}

/// A lifecycle event raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The connection was accepted and started
    Connected,
    /// Data arrived and was appended to the connection's receive buffer
    Received {
        /// The bytes read in this completion
        bytes: Bytes,
    },
    /// A queued transmit was written and flushed
    Sent,
    /// The connection closed; it is removed from the registry after the
    /// application has observed this event
    Closed(CloseReason),
}

impl Event {
    /// Whether this event terminates the connection.
    pub fn is_closed(&self) -> bool {
        matches!(self, Event::Closed(_))
    }
}

/// An event tagged with the originating connection.
#[derive(Debug, Clone)]
pub struct ServerEvent {
    /// The originating connection
    pub id: ConnectionId,
    /// The lifecycle event
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_predicate() {
        assert!(Event::Closed(CloseReason::Peer).is_closed());
        assert!(Event::Closed(CloseReason::Timeout).is_closed());
        assert!(!Event::Connected.is_closed());
        assert!(!Event::Sent.is_closed());
        assert!(!Event::Received { bytes: Bytes::new() }.is_closed());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "#7");
    }
}
