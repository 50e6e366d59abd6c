//! Relay Session

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::pair::{CloseReason, Direction};

/// Byte counters and identity of one forwarded connection
#[derive(Debug)]
pub struct RelaySession {
    pub connection_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: Option<SocketAddr>,
    pub start_time: Instant,
    bytes_up: AtomicU64,
    bytes_down: AtomicU64,
}

/// Summary of a relay pair after both loops have returned
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub connection_id: String,
    pub client_addr: SocketAddr,
    pub upstream_addr: Option<SocketAddr>,
    pub duration: Duration,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub close_reason: CloseReason,
}

impl RelaySession {
    /// Create a new relay session
    pub fn new(
        connection_id: String,
        client_addr: SocketAddr,
        upstream_addr: Option<SocketAddr>,
    ) -> Self {
        debug!(
            "Creating relay session {} ({} -> {:?})",
            connection_id, client_addr, upstream_addr
        );

        Self {
            connection_id,
            client_addr,
            upstream_addr,
            start_time: Instant::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
        }
    }

    /// Bytes forwarded client -> upstream
    pub fn bytes_up(&self) -> u64 {
        self.bytes_up.load(Ordering::Relaxed)
    }

    /// Bytes forwarded upstream -> client
    pub fn bytes_down(&self) -> u64 {
        self.bytes_down.load(Ordering::Relaxed)
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes_up() + self.bytes_down()
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Count bytes written in `direction`
    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::ClientToUpstream => self.bytes_up.fetch_add(bytes, Ordering::Relaxed),
            Direction::UpstreamToClient => self.bytes_down.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    /// Snapshot the session into a report
    pub fn to_report(&self, close_reason: CloseReason) -> RelayReport {
        RelayReport {
            connection_id: self.connection_id.clone(),
            client_addr: self.client_addr,
            upstream_addr: self.upstream_addr,
            duration: self.duration(),
            bytes_up: self.bytes_up(),
            bytes_down: self.bytes_down(),
            close_reason,
        }
    }
}

impl RelayReport {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_up + self.bytes_down
    }

    /// Emit the termination log line for this pair
    pub fn log(&self) {
        let upstream = self
            .upstream_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if self.close_reason.is_error() {
            warn!(
                connection_id = %self.connection_id,
                peer = %self.client_addr,
                upstream = %upstream,
                duration_ms = self.duration.as_millis() as u64,
                bytes_up = self.bytes_up,
                bytes_down = self.bytes_down,
                outcome = %self.close_reason,
                "Relay pair closed with error"
            );
        } else {
            info!(
                connection_id = %self.connection_id,
                peer = %self.client_addr,
                upstream = %upstream,
                duration_ms = self.duration.as_millis() as u64,
                bytes_up = self.bytes_up,
                bytes_down = self.bytes_down,
                outcome = %self.close_reason,
                "Relay pair closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_track_each_direction() {
        let client_addr: SocketAddr = "127.0.0.1:12345".parse().unwrap();
        let upstream_addr: SocketAddr = "127.0.0.1:55078".parse().unwrap();

        let session = RelaySession::new("conn".to_string(), client_addr, Some(upstream_addr));
        assert_eq!(session.total_bytes(), 0);

        session.add_bytes(Direction::ClientToUpstream, 1024);
        session.add_bytes(Direction::UpstreamToClient, 2048);
        session.add_bytes(Direction::UpstreamToClient, 1);

        let report = session.to_report(CloseReason::Eof(Direction::UpstreamToClient));
        assert_eq!(report.connection_id, "conn");
        assert_eq!(report.client_addr, client_addr);
        assert_eq!(report.upstream_addr, Some(upstream_addr));
        assert_eq!(report.bytes_up, 1024);
        assert_eq!(report.bytes_down, 2049);
        assert_eq!(report.total_bytes(), 3073);
        assert!(!report.close_reason.is_error());
    }
}
