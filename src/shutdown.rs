//! Graceful Shutdown Handling
//!
//! Listens for SIGTERM/SIGINT (Ctrl+C elsewhere) and drives the connection
//! manager through stop-accepting, drain, and force-close.

use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::connection::{ConnectionManager, RelayListener, ShutdownReport};
use crate::error::RelayError;
use crate::Result;

/// Shutdown coordinator that manages graceful shutdown process
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Grace period before in-flight relay pairs are force-closed
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            timeout,
        }
    }

    /// Get a shutdown receiver for components to listen for shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Broadcast the shutdown signal without waiting for an OS signal
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown signal sent with no subscribers");
        }
    }

    /// Run the accept loop on `listener` until the shutdown signal is broadcast.
    ///
    /// The receiver is subscribed before the task is spawned, so a signal sent
    /// right after this returns still stops the server.
    pub fn spawn_server(
        &self,
        manager: Arc<ConnectionManager>,
        listener: RelayListener,
    ) -> JoinHandle<std::result::Result<(), RelayError>> {
        let mut shutdown_rx = self.subscribe();

        tokio::spawn(async move {
            let serve = manager.serve(listener);
            tokio::pin!(serve);

            tokio::select! {
                result = &mut serve => result,
                _ = shutdown_rx.recv() => {
                    info!("Server task received shutdown signal");
                    manager.initiate_shutdown();
                    serve.await
                }
            }
        })
    }

    /// Wait for SIGTERM/SIGINT, then broadcast shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }

    /// Stop accepting, drain for the grace period, then force-close
    pub async fn shutdown_connection_manager(
        &self,
        connection_manager: &ConnectionManager,
    ) -> ShutdownReport {
        info!("Initiating graceful shutdown of connection manager");
        let report = connection_manager.shutdown_with_grace(self.timeout).await;

        if report.force_closed > 0 || report.leaked > 0 {
            warn!(
                drained = report.drained,
                force_closed = report.force_closed,
                leaked = report.leaked,
                "Shutdown finished after force-closing relay pairs"
            );
        } else {
            info!(drained = report.drained, "Shutdown finished, all relay pairs drained");
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[tokio::test]
    async fn test_shutdown_signal_broadcast() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();

        coordinator.trigger();

        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_trigger_stops_spawned_server() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let mut config = Config::default();
        config.listener.bind_port = 0;
        let listener = RelayListener::bind(&config.listener).await.unwrap();
        let addr = listener.local_addr();
        let manager = Arc::new(ConnectionManager::new(Arc::new(config)));

        let server = coordinator.spawn_server(Arc::clone(&manager), listener);

        // The server task holds a receiver, so the broadcast reaches it.
        assert_eq!(coordinator.shutdown_tx.receiver_count(), 1);
        coordinator.trigger();

        let served = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        assert!(served.is_ok());
        assert!(manager.is_shutting_down());
        assert!(!manager.is_accepting());
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_idle_manager() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(100));
        let manager = ConnectionManager::new(Arc::new(Config::default()));

        let report = coordinator.shutdown_connection_manager(&manager).await;
        assert_eq!(report.drained, 0);
        assert_eq!(report.force_closed, 0);
        assert!(manager.is_shutting_down());
    }
}
