//! Upstream Dialer

use std::io;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{Config, UpstreamTarget};
use crate::error::RelayError;

/// Opens a fresh upstream connection for every accepted client
#[derive(Debug, Clone)]
pub struct UpstreamDialer {
    target: UpstreamTarget,
    nodelay: bool,
}

impl UpstreamDialer {
    /// Create a new dialer for `target`
    pub fn new(target: UpstreamTarget) -> Self {
        Self {
            target,
            nodelay: true,
        }
    }

    /// Create a new dialer from configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            target: config.upstream.clone(),
            nodelay: config.relay.nodelay,
        }
    }

    pub fn target(&self) -> &UpstreamTarget {
        &self.target
    }

    /// Connect to the upstream target within the configured connect timeout.
    ///
    /// The timeout covers name resolution and every address attempt.
    pub async fn dial(&self) -> Result<TcpStream, RelayError> {
        let endpoint = self.target.endpoint();
        debug!("Dialing upstream {}", endpoint);

        match timeout(self.target.connect_timeout, self.connect_any(&endpoint)).await {
            Ok(Ok(stream)) => {
                if self.nodelay {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on upstream socket: {}", e);
                    }
                }
                Ok(stream)
            }
            Ok(Err(source)) => Err(RelayError::Dial {
                target: endpoint,
                source,
            }),
            Err(_) => Err(RelayError::DialTimeout {
                target: endpoint,
                timeout: self.target.connect_timeout,
            }),
        }
    }

    /// Try each resolved address in turn
    async fn connect_any(&self, endpoint: &str) -> io::Result<TcpStream> {
        let addrs = lookup_host(endpoint).await?;

        let mut last_error = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!("Connected to upstream {}", addr);
                    return Ok(stream);
                }
                Err(e) => {
                    warn!("Failed to connect to upstream address {}: {}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no addresses resolved for {}", endpoint),
            )
        }))
    }
}
