//! tunrelay - local TCP relay into an existing tunnel endpoint
//!
//! Listens on a loopback port and forwards every connection, unmodified, to a
//! second local port (typically the local end of an `ssh -L` forward).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tunrelay::config::{ConfigManager, ConfigSource};
use tunrelay::{ConnectionManager, RelayListener, ShutdownCoordinator};

/// CLI arguments for tunrelay
#[derive(Parser, Debug)]
#[command(name = "tunrelay")]
#[command(about = "Local TCP relay that forwards a loopback port into a tunnel endpoint")]
#[command(version)]
#[command(long_about = "
tunrelay - local TCP relay

Accepts connections on a local port and forwards each one, byte for byte, to
a fixed upstream port. The upstream is usually the local end of an SSH tunnel:

  ssh -L 55078:<node>:<port> <user>@<login-host>

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables (fill any key the file omits)
4. Built-in defaults

Environment variables:
  TUNRELAY_BIND_HOST         - Local bind host (default 127.0.0.1)
  TUNRELAY_BIND_PORT         - Local bind port (default 55077)
  TUNRELAY_UPSTREAM_HOST     - Upstream host (default 127.0.0.1)
  TUNRELAY_UPSTREAM_PORT     - Upstream port (default 55078)
  TUNRELAY_CONNECT_TIMEOUT   - Upstream connect timeout (e.g. 5s)
  TUNRELAY_BUFFER_SIZE       - Copy buffer size in bytes
  TUNRELAY_SHUTDOWN_TIMEOUT  - Drain grace period on shutdown (e.g. 30s)
  TUNRELAY_LOG_LEVEL         - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "tunrelay.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Local bind host (overrides config file)
    #[arg(long, help = "Local bind host (e.g., 127.0.0.1)")]
    pub bind_host: Option<String>,

    /// Local port to listen on (overrides config file)
    #[arg(short, long, help = "Local port to listen on")]
    pub port: Option<u16>,

    /// Upstream host (overrides config file)
    #[arg(long, help = "Upstream host to forward to")]
    pub upstream_host: Option<String>,

    /// Upstream port (overrides config file)
    #[arg(short, long, help = "Upstream port to forward to")]
    pub upstream_port: Option<u16>,

    /// Upstream connect timeout in seconds
    #[arg(long, help = "Upstream connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    /// Buffer size in bytes
    #[arg(long, help = "Copy buffer size in bytes")]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Loading is reported below, after the configured log level is installed.
    let (mut config, source) = ConfigManager::load(&args.config)?;

    let overrides = config.merge_with_cli_args(
        args.bind_host.as_deref(),
        args.port,
        args.upstream_host.as_deref(),
        args.upstream_port,
        args.connect_timeout,
        args.buffer_size,
        args.log_level.as_deref(),
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    init_tracing(&args, &config.logging.level)?;

    info!("Starting tunrelay v{}", env!("CARGO_PKG_VERSION"));
    if let ConfigSource::Environment = source {
        warn!(
            "Configuration file not found at {}, using environment and defaults",
            args.config.display()
        );
    }
    info!("Configuration loaded from {}", source);
    for applied in &overrides {
        info!("CLI override: {}", applied);
    }

    if args.validate_config {
        info!("Configuration is valid");
        info!("Configuration summary:");
        info!("  Listen: {}", config.listener.endpoint());
        info!("  Upstream: {}", config.upstream.endpoint());
        info!("  Connect timeout: {:?}", config.upstream.connect_timeout);
        info!("  Buffer size: {} bytes", config.relay.buffer_size);
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    info!(
        "Forwarding {} -> {}",
        config.listener.endpoint(),
        config.upstream.endpoint()
    );
    info!(
        "The upstream tunnel should forward {} to the remote service, e.g. ssh -L {}:<node>:<port> <login-host>",
        config.upstream.endpoint(),
        config.upstream.port
    );

    let listener = RelayListener::bind(&config.listener)
        .await
        .context("Failed to start relay listener")?;

    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let manager = Arc::new(ConnectionManager::new(Arc::new(config)));

    let mut server_handle = shutdown_coordinator.spawn_server(Arc::clone(&manager), listener);

    info!("tunrelay started, press Ctrl+C or send SIGTERM to stop");

    tokio::select! {
        joined = &mut server_handle => {
            // The accept loop only returns on its own when the listener failed.
            shutdown_coordinator.shutdown_connection_manager(&manager).await;
            return match joined {
                Ok(Ok(())) => Err(anyhow!("Accept loop stopped unexpectedly")),
                Ok(Err(e)) => Err(e).context("Relay listener failed"),
                Err(e) => Err(anyhow!("Server task failed: {}", e)),
            };
        }
        signal = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal {
                error!("Error setting up signal handlers: {}", e);
            }
        }
    }

    info!("Initiating graceful shutdown...");
    shutdown_coordinator
        .shutdown_connection_manager(&manager)
        .await;

    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Accept loop ended with error during shutdown: {}", e),
        Err(e) if !e.is_cancelled() => error!("Server task failed: {}", e),
        Err(_) => {}
    }

    info!("Relay shutdown complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(args: &CliArgs, configured_level: &str) -> Result<()> {
    let log_level = if args.verbose {
        "debug"
    } else {
        configured_level
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .with(env_filter)
        .init();

    Ok(())
}
