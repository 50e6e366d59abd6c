//! Relay Error Taxonomy
//!
//! Only `Bind` and `Listener` are fatal to the process. `Dial` and `RelayIo`
//! are scoped to a single connection and never escalate past its task.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the listener, dialer and relay pairs.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The configured local address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listening socket became unusable after startup.
    #[error("listener on {addr} failed: {source}")]
    Listener {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The upstream target could not be reached.
    #[error("failed to dial upstream {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    /// The upstream dial did not complete within the connect timeout.
    #[error("dial to upstream {target} timed out after {timeout:?}")]
    DialTimeout { target: String, timeout: Duration },

    /// A read or write failed while forwarding.
    #[error("relay I/O error ({direction}): {source}")]
    RelayIo {
        direction: &'static str,
        #[source]
        source: io::Error,
    },
}

impl RelayError {
    /// Returns true if this error must terminate the service.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayError::Bind { .. } | RelayError::Listener { .. })
    }

    /// Returns true for either flavour of upstream dial failure.
    pub fn is_dial(&self) -> bool {
        matches!(self, RelayError::Dial { .. } | RelayError::DialTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_bind_and_listener_are_fatal() {
        let bind = RelayError::Bind {
            addr: "127.0.0.1:1".into(),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        let listener = RelayError::Listener {
            addr: "127.0.0.1:1".parse().unwrap(),
            source: io::Error::from(io::ErrorKind::InvalidInput),
        };
        let dial = RelayError::DialTimeout {
            target: "127.0.0.1:2".into(),
            timeout: Duration::from_secs(1),
        };
        let relay = RelayError::RelayIo {
            direction: "client->upstream",
            source: io::Error::from(io::ErrorKind::BrokenPipe),
        };

        assert!(bind.is_fatal());
        assert!(listener.is_fatal());
        assert!(!dial.is_fatal());
        assert!(dial.is_dial());
        assert!(!relay.is_fatal());
        assert!(!relay.is_dial());
    }

    #[test]
    fn messages_name_the_endpoint() {
        let err = RelayError::Dial {
            target: "127.0.0.1:55078".into(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("127.0.0.1:55078"));
    }
}
