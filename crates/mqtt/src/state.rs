//! Connection state tracking.
//!
//! The connection kernel publishes its state through a `watch` channel so
//! that the manager can wait for the first CONNACK and the instance can
//! answer "are we still connected?" without touching the event loop.

use std::fmt;

/// Represents the current state of a broker connection.
///
/// Lifecycle: `Connecting` -> `Connected` -> `Disconnected`. There is no
/// way back from `Disconnected`; a fresh connection is built instead.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT sent, waiting for CONNACK.
    Connecting,

    /// CONNACK received, publishes and subscriptions are possible.
    Connected,

    /// Connection lost or closed; the `String` carries the reason.
    Disconnected(String),
}

impl ConnectionState {
    /// Returns a short identifier for logging.
    fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
        }
    }

    /// True only in `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected(reason) => write!(f, "Disconnected ({reason})"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected("eof".into()).is_connected());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "Connected");
        assert_eq!(
            ConnectionState::Disconnected("broker went away".into()).to_string(),
            "Disconnected (broker went away)"
        );
    }
}
