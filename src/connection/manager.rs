//! Connection Manager Implementation
//!
//! Owns the accept loop and fans every accepted client out to its own task:
//! `ACCEPTED -> DIALING -> RELAYING -> CLOSED`, or
//! `ACCEPTED -> DIALING -> DIAL_FAILED -> CLOSED` when the upstream is down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::listener::RelayListener;
use crate::config::Config;
use crate::error::RelayError;
use crate::relay::{CloseReason, RelayPair, RelaySession, UpstreamDialer};

/// Extra time granted to force-closed pairs to finish joining.
const FORCE_CLOSE_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Dialing,
    DialFailed,
    Relaying,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            ConnectionState::Accepted => "ACCEPTED",
            ConnectionState::Dialing => "DIALING",
            ConnectionState::DialFailed => "DIAL_FAILED",
            ConnectionState::Relaying => "RELAYING",
            ConnectionState::Closed => "CLOSED",
        };
        f.write_str(state)
    }
}

/// Connection statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub total_connections_served: u64,
    pub dial_failures: u64,
}

/// Result of [`ConnectionManager::shutdown`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Pairs that finished on their own inside the grace period.
    pub drained: usize,
    /// Pairs that had to be torn down once the grace period ran out.
    pub force_closed: usize,
    /// Tasks still running after the force-close join timeout.
    pub leaked: usize,
}

/// Counters shared with the per-connection tasks
#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    total: AtomicU64,
    dial_failures: AtomicU64,
    idle: Notify,
}

/// Keeps a connection counted as active for as long as its task runs
struct ActiveConnection {
    counters: Arc<Counters>,
}

impl ActiveConnection {
    fn new(counters: Arc<Counters>) -> Self {
        counters.active.fetch_add(1, Ordering::AcqRel);
        counters.total.fetch_add(1, Ordering::Relaxed);
        Self { counters }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        if self.counters.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.counters.idle.notify_waiters();
        }
    }
}

/// Marks the accept loop as running until it returns or is dropped
struct AcceptLoop<'a> {
    accepting: &'a AtomicBool,
    stopped: &'a Notify,
}

impl<'a> AcceptLoop<'a> {
    fn enter(accepting: &'a AtomicBool, stopped: &'a Notify) -> Self {
        accepting.store(true, Ordering::SeqCst);
        Self { accepting, stopped }
    }
}

impl Drop for AcceptLoop<'_> {
    fn drop(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.stopped.notify_waiters();
    }
}

/// Manages the accept loop and the lifecycle of every relay pair
pub struct ConnectionManager {
    config: Arc<Config>,
    dialer: Arc<UpstreamDialer>,
    counters: Arc<Counters>,
    shutdown_flag: AtomicBool,
    /// Set while `serve` may still hand out new connections
    accepting: AtomicBool,
    accept_stopped: Notify,
    /// Stops the accept loop
    shutdown_tx: broadcast::Sender<()>,
    /// Tears down every in-flight pair
    force_close_tx: broadcast::Sender<()>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager
    pub fn new(config: Arc<Config>) -> Self {
        let dialer = Arc::new(UpstreamDialer::from_config(&config));
        let (shutdown_tx, _) = broadcast::channel(1);
        let (force_close_tx, _) = broadcast::channel(1);

        Self {
            config,
            dialer,
            counters: Arc::new(Counters::default()),
            shutdown_flag: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            accept_stopped: Notify::new(),
            shutdown_tx,
            force_close_tx,
        }
    }

    /// Bind the configured listener and serve until shutdown or a fatal error
    pub async fn start(&self) -> Result<(), RelayError> {
        let listener = RelayListener::bind(&self.config.listener).await?;
        self.serve(listener).await
    }

    /// Run the accept loop on an already bound listener.
    ///
    /// Returns `Ok(())` after [`ConnectionManager::initiate_shutdown`], or a
    /// fatal [`RelayError::Listener`]. The listener is closed on return.
    pub async fn serve(&self, listener: RelayListener) -> Result<(), RelayError> {
        let local_addr = listener.local_addr();
        let _accept_loop = AcceptLoop::enter(&self.accepting, &self.accept_stopped);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        info!(
            "Relaying {} -> {}",
            local_addr,
            self.dialer.target().endpoint()
        );

        let result = loop {
            if self.shutdown_flag.load(Ordering::SeqCst) {
                info!("Shutdown flag set, stopping connection acceptance");
                break Ok(());
            }

            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => self.spawn_connection(stream, peer),
                        Err(e) => {
                            error!("Listener on {} is no longer usable: {}", local_addr, e);
                            break Err(e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break Ok(());
                }
            }
        };

        drop(listener);
        info!("Listener on {} closed", local_addr);
        result
    }

    /// Hand an accepted client to its own task
    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let connection_id = Uuid::new_v4().to_string();
        let active = ActiveConnection::new(Arc::clone(&self.counters));
        let dialer = Arc::clone(&self.dialer);
        let counters = Arc::clone(&self.counters);
        let force_close_rx = self.force_close_tx.subscribe();
        let buffer_size = self.config.relay.buffer_size;
        let nodelay = self.config.relay.nodelay;

        info!(
            connection_id = %connection_id,
            peer = %peer,
            state = %ConnectionState::Accepted,
            "Client connected"
        );

        let span = info_span!("connection", connection_id = %connection_id, peer = %peer);
        tokio::spawn(
            async move {
                let _active = active;
                let state = Self::handle_connection(
                    stream,
                    peer,
                    connection_id,
                    dialer,
                    buffer_size,
                    nodelay,
                    force_close_rx,
                )
                .await;
                if state == ConnectionState::DialFailed {
                    counters.dial_failures.fetch_add(1, Ordering::Relaxed);
                }
                debug!(state = %ConnectionState::Closed, "Connection finished");
            }
            .instrument(span),
        );
    }

    /// Dial the upstream and relay until either side is done.
    ///
    /// Returns the last state reached before `CLOSED`.
    async fn handle_connection(
        client: TcpStream,
        peer: SocketAddr,
        connection_id: String,
        dialer: Arc<UpstreamDialer>,
        buffer_size: usize,
        nodelay: bool,
        mut force_close_rx: broadcast::Receiver<()>,
    ) -> ConnectionState {
        debug!(state = %ConnectionState::Dialing, "Dialing upstream {}", dialer.target().endpoint());

        let upstream = tokio::select! {
            dialed = dialer.dial() => match dialed {
                Ok(upstream) => upstream,
                Err(e) => {
                    warn!(
                        connection_id = %connection_id,
                        peer = %peer,
                        state = %ConnectionState::DialFailed,
                        "Closing client, upstream dial failed: {}", e
                    );
                    drop(client);
                    return ConnectionState::DialFailed;
                }
            },
            _ = force_close_rx.recv() => {
                info!(connection_id = %connection_id, "Shutdown while dialing, closing client");
                return ConnectionState::Dialing;
            }
        };

        if nodelay {
            if let Err(e) = client.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY on client socket: {}", e);
            }
        }

        let session = Arc::new(RelaySession::new(
            connection_id,
            peer,
            upstream.peer_addr().ok(),
        ));
        let pair = RelayPair::new(client, upstream, buffer_size);
        let guard = pair.close_handle();

        debug!(state = %ConnectionState::Relaying, "Relay pair established");

        let relay = pair.run(Arc::clone(&session));
        tokio::pin!(relay);

        let reason = tokio::select! {
            reason = &mut relay => reason,
            _ = force_close_rx.recv() => {
                if guard.close(CloseReason::Shutdown) {
                    info!(connection_id = %session.connection_id, "Force-closing relay pair");
                }
                relay.await
            }
        };

        session.to_report(reason).log();
        ConnectionState::Relaying
    }

    /// Get the number of active connections
    pub fn get_active_connections(&self) -> usize {
        self.counters.active.load(Ordering::Acquire)
    }

    /// Get connection statistics
    pub fn get_connection_stats(&self) -> ConnectionStats {
        ConnectionStats {
            active_connections: self.get_active_connections(),
            total_connections_served: self.counters.total.load(Ordering::Relaxed),
            dial_failures: self.counters.dial_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting new connections
    pub fn initiate_shutdown(&self) {
        if self.shutdown_flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Initiating graceful shutdown of connection manager");

        // No receiver just means the accept loop is not running.
        let _ = self.shutdown_tx.send(());
    }

    /// Check if shutdown has been initiated
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::SeqCst)
    }

    /// True while the accept loop is running and may spawn new connections
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Wait for the accept loop to return, so no connection can be spawned
    /// after this resolves.
    async fn wait_for_accept_loop(&self) {
        loop {
            let stopped = self.accept_stopped.notified();
            if !self.is_accepting() {
                return;
            }
            stopped.await;
        }
    }

    /// Tear down every in-flight relay pair immediately
    pub fn force_close_all(&self) {
        let _ = self.force_close_tx.send(());
    }

    /// Wait until no connection task is running, up to `limit`.
    ///
    /// Returns the number of tasks still running when the wait ended.
    pub async fn wait_for_connections_to_close(&self, limit: Duration) -> usize {
        let wait_idle = async {
            loop {
                let idle = self.counters.idle.notified();
                if self.get_active_connections() == 0 {
                    return;
                }
                idle.await;
            }
        };

        let _ = timeout(limit, wait_idle).await;
        self.get_active_connections()
    }

    /// Gracefully shutdown using the configured grace period
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_grace(self.config.server.shutdown_timeout).await
    }

    /// Stop accepting, let pairs drain for `grace`, then force-close the rest
    pub async fn shutdown_with_grace(&self, grace: Duration) -> ShutdownReport {
        self.initiate_shutdown();
        // A connection accepted in the same instant must be subscribed to
        // force-close before the count below is taken.
        self.wait_for_accept_loop().await;

        let start_time = Instant::now();
        let in_flight = self.get_active_connections();
        info!(
            "Waiting for {} active connections to close (timeout: {:?})",
            in_flight, grace
        );

        let remaining = self.wait_for_connections_to_close(grace).await;
        if remaining == 0 {
            info!("All connections closed gracefully in {:?}", start_time.elapsed());
            return ShutdownReport {
                drained: in_flight,
                force_closed: 0,
                leaked: 0,
            };
        }

        warn!(
            "Shutdown grace period of {:?} elapsed with {} connections still active, force-closing",
            grace, remaining
        );
        self.force_close_all();

        let leaked = self
            .wait_for_connections_to_close(FORCE_CLOSE_JOIN_TIMEOUT)
            .await;
        if leaked > 0 {
            error!("{} connection tasks did not finish after force-close", leaked);
        } else {
            info!("All connections closed in {:?}", start_time.elapsed());
        }

        ShutdownReport {
            drained: in_flight.saturating_sub(remaining),
            force_closed: remaining.saturating_sub(leaked),
            leaked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_manager_is_idle() {
        let manager = ConnectionManager::new(Arc::new(Config::default()));
        assert_eq!(manager.get_active_connections(), 0);
        assert!(!manager.is_shutting_down());
        assert_eq!(
            manager.get_connection_stats(),
            ConnectionStats {
                active_connections: 0,
                total_connections_served: 0,
                dial_failures: 0,
            }
        );
    }

    #[tokio::test]
    async fn shutdown_without_connections_is_immediate() {
        let manager = ConnectionManager::new(Arc::new(Config::default()));
        let report = timeout(Duration::from_secs(1), manager.shutdown())
            .await
            .unwrap();
        assert_eq!(
            report,
            ShutdownReport {
                drained: 0,
                force_closed: 0,
                leaked: 0,
            }
        );
        assert!(manager.is_shutting_down());
    }

    #[test]
    fn active_guard_counts_and_notifies() {
        let counters = Arc::new(Counters::default());
        let first = ActiveConnection::new(Arc::clone(&counters));
        let second = ActiveConnection::new(Arc::clone(&counters));
        assert_eq!(counters.active.load(Ordering::Acquire), 2);
        drop(first);
        drop(second);
        assert_eq!(counters.active.load(Ordering::Acquire), 0);
        assert_eq!(counters.total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectionState::DialFailed.to_string(), "DIAL_FAILED");
        assert_eq!(ConnectionState::Closed.to_string(), "CLOSED");
    }
}
