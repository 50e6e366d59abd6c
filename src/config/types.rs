//! Configuration Types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default local port the relay listens on.
pub const DEFAULT_BIND_PORT: u16 = 55077;
/// Default port of the tunnel endpoint traffic is forwarded to.
pub const DEFAULT_UPSTREAM_PORT: u16 = 55078;
/// Default per-direction copy buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listener: ListenerConfig,
    pub upstream: UpstreamTarget,
    pub relay: RelayConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Local address the relay accepts connections on
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub backlog: u32,
}

/// The fixed destination every accepted connection is forwarded to
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

/// Data path settings shared by every relay pair
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    pub buffer_size: usize,
    pub nodelay: bool,
}

/// Process lifecycle settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl ListenerConfig {
    /// Host and port joined for resolution and logging
    pub fn endpoint(&self) -> String {
        join_host_port(&self.bind_host, self.bind_port)
    }
}

impl UpstreamTarget {
    /// Host and port joined for resolution and logging
    pub fn endpoint(&self) -> String {
        join_host_port(&self.host, self.port)
    }
}

/// Bracket bare IPv6 literals so the result parses as `host:port`.
fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            upstream: UpstreamTarget::default(),
            relay: RelayConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: DEFAULT_BIND_PORT,
            backlog: 1024,
        }
    }
}

impl Default for UpstreamTarget {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_UPSTREAM_PORT,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            nodelay: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bind_loopback_only() {
        let config = Config::default();
        assert_eq!(config.listener.bind_host, "127.0.0.1");
        assert_eq!(config.listener.bind_port, 55077);
        assert_eq!(config.upstream.host, "127.0.0.1");
        assert_eq!(config.upstream.port, 55078);
        assert_eq!(config.relay.buffer_size, 8192);
    }

    #[test]
    fn endpoint_brackets_ipv6() {
        let mut target = UpstreamTarget::default();
        target.host = "::1".to_string();
        target.port = 9000;
        assert_eq!(target.endpoint(), "[::1]:9000");

        target.host = "localhost".to_string();
        assert_eq!(target.endpoint(), "localhost:9000");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            port = 11434
            connect_timeout = "2s"
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.port, 11434);
        assert_eq!(config.upstream.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.upstream.host, "127.0.0.1");
        assert_eq!(config.listener.bind_port, DEFAULT_BIND_PORT);
        assert_eq!(config.server.shutdown_timeout, Duration::from_secs(30));
    }
}
