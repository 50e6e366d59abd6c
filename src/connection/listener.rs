//! TCP Listener
//!
//! Binds the local relay port with address reuse and sorts accept errors into
//! ones the accept loop can step over and ones that end the service.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tracing::{info, warn};

use crate::config::ListenerConfig;
use crate::error::RelayError;

/// Pause after descriptor or buffer exhaustion before accepting again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How an accept error affects the accept loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// A single bad connection attempt; keep accepting.
    Transient,
    /// The process ran out of descriptors or buffers; back off, then keep accepting.
    Exhausted,
    /// The listening socket itself is unusable.
    Fatal,
}

/// Classify an error returned by `accept()`
pub fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::PermissionDenied => return AcceptErrorKind::Transient,
        io::ErrorKind::OutOfMemory => return AcceptErrorKind::Exhausted,
        _ => {}
    }

    #[cfg(unix)]
    if let Some(code) = err.raw_os_error() {
        match code {
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                return AcceptErrorKind::Exhausted
            }
            libc::EPROTO
            | libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::ENETDOWN
            | libc::ENETUNREACH
            | libc::EOPNOTSUPP => return AcceptErrorKind::Transient,
            _ => {}
        }
    }

    AcceptErrorKind::Fatal
}

/// The bound relay listener
#[derive(Debug)]
pub struct RelayListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RelayListener {
    /// Bind the configured host and port.
    ///
    /// Every resolved address is tried in order; the first one that binds wins.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, RelayError> {
        let endpoint = config.endpoint();

        let addrs = lookup_host(endpoint.as_str())
            .await
            .map_err(|source| RelayError::Bind {
                addr: endpoint.clone(),
                source,
            })?;

        let mut last_error = None;
        for addr in addrs {
            match Self::bind_addr(addr, config.backlog) {
                Ok(listener) => {
                    let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
                        addr: endpoint.clone(),
                        source,
                    })?;
                    info!(bind_addr = %local_addr, backlog = config.backlog, "Listener bound");
                    return Ok(Self {
                        listener,
                        local_addr,
                    });
                }
                Err(e) => {
                    warn!("Failed to bind {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(RelayError::Bind {
            addr: endpoint.clone(),
            source: last_error.unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("no addresses resolved for {}", endpoint),
                )
            }),
        })
    }

    fn bind_addr(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        // SO_REUSEADDR on Windows would let a second instance steal the port.
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        socket.listen(backlog)
    }

    /// The address actually bound (resolves port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next connection.
    ///
    /// Transient errors are logged and skipped; only an error that leaves the
    /// listening socket unusable is returned, as [`RelayError::Listener`].
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), RelayError> {
        loop {
            match self.listener.accept().await {
                Ok(accepted) => return Ok(accepted),
                Err(e) => match classify_accept_error(&e) {
                    AcceptErrorKind::Transient => {
                        warn!("Transient accept error on {}: {}", self.local_addr, e);
                    }
                    AcceptErrorKind::Exhausted => {
                        warn!(
                            "Accept on {} hit resource exhaustion, backing off {:?}: {}",
                            self.local_addr, ACCEPT_BACKOFF, e
                        );
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    AcceptErrorKind::Fatal => {
                        return Err(RelayError::Listener {
                            addr: self.local_addr,
                            source: e,
                        });
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(port: u16) -> ListenerConfig {
        ListenerConfig {
            bind_host: "127.0.0.1".to_string(),
            bind_port: port,
            backlog: 128,
        }
    }

    #[tokio::test]
    async fn binds_ephemeral_port_on_loopback() {
        let listener = RelayListener::bind(&loopback(0)).await.unwrap();
        let addr = listener.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let client = TcpStream::connect(addr).await.unwrap();
        let (_, peer) = listener.accept().await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn second_bind_on_same_port_fails() {
        let first = RelayListener::bind(&loopback(0)).await.unwrap();
        let port = first.local_addr().port();

        let err = RelayListener::bind(&loopback(port)).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn unresolvable_host_is_bind_error() {
        let mut config = loopback(0);
        config.bind_host = "host.invalid".to_string();
        let err = RelayListener::bind(&config).await.unwrap_err();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[test]
    fn accept_error_classification() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(classify_accept_error(&aborted), AcceptErrorKind::Transient);

        let invalid = io::Error::from(io::ErrorKind::InvalidInput);
        assert_eq!(classify_accept_error(&invalid), AcceptErrorKind::Fatal);

        #[cfg(unix)]
        {
            let emfile = io::Error::from_raw_os_error(libc::EMFILE);
            assert_eq!(classify_accept_error(&emfile), AcceptErrorKind::Exhausted);

            let ebadf = io::Error::from_raw_os_error(libc::EBADF);
            assert_eq!(classify_accept_error(&ebadf), AcceptErrorKind::Fatal);
        }
    }
}
