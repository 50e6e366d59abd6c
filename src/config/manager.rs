//! Configuration Manager

use super::Config;
use crate::Result;
use anyhow::{bail, Context};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the loaded configuration came from, reported once logging is up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A TOML file, layered over environment variables and defaults.
    File(PathBuf),
    /// No file was found; environment variables over defaults only.
    Environment,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{} (over environment and defaults)", path.display()),
            ConfigSource::Environment => f.write_str("environment and defaults"),
        }
    }
}

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from `path` layered over the process environment
    pub fn load(path: &Path) -> Result<(Config, ConfigSource)> {
        Self::load_layered(path, |key| std::env::var(key).ok())
    }

    /// Build the configuration from defaults, then `TUNRELAY_*` variables
    /// looked up through `lookup`, then the TOML file at `path` if it exists.
    ///
    /// Keys the file omits keep their environment or default value.
    pub fn load_layered<F>(path: &Path, lookup: F) -> Result<(Config, ConfigSource)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        Self::apply_env_vars(&mut config, lookup)?;

        if !path.exists() {
            config.validate()?;
            return Ok((config, ConfigSource::Environment));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let file: toml::Table = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        let mut layered = match toml::Value::try_from(&config)
            .context("Failed to encode environment configuration")?
        {
            toml::Value::Table(table) => table,
            _ => bail!("Configuration did not encode as a TOML table"),
        };
        merge_tables(&mut layered, file);

        let config: Config = toml::Value::Table(layered)
            .try_into()
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok((config, ConfigSource::File(path.to_path_buf())))
    }

    /// Apply `TUNRELAY_*` overrides looked up through `lookup` on top of the defaults
    pub fn load_from_vars<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        Self::apply_env_vars(&mut config, lookup)?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_vars<F>(config: &mut Config, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("TUNRELAY_BIND_HOST") {
            config.listener.bind_host = host;
        }

        if let Some(port) = lookup("TUNRELAY_BIND_PORT") {
            config.listener.bind_port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TUNRELAY_BIND_PORT: {}", port))?;
        }

        if let Some(host) = lookup("TUNRELAY_UPSTREAM_HOST") {
            config.upstream.host = host;
        }

        if let Some(port) = lookup("TUNRELAY_UPSTREAM_PORT") {
            config.upstream.port = port
                .parse::<u16>()
                .with_context(|| format!("Invalid TUNRELAY_UPSTREAM_PORT: {}", port))?;
        }

        if let Some(timeout) = lookup("TUNRELAY_CONNECT_TIMEOUT") {
            config.upstream.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TUNRELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(buffer_size) = lookup("TUNRELAY_BUFFER_SIZE") {
            config.relay.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid TUNRELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(timeout) = lookup("TUNRELAY_SHUTDOWN_TIMEOUT") {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid TUNRELAY_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = lookup("TUNRELAY_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        Ok(())
    }
}

/// Recursively overlay `overlay` onto `base`; tables merge, other values replace.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_listener_config()
            .with_context(|| "Listener configuration validation failed")?;

        self.validate_upstream_config()
            .with_context(|| "Upstream configuration validation failed")?;

        self.validate_relay_config()
            .with_context(|| "Relay configuration validation failed")?;

        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_listener_config(&self) -> Result<()> {
        if self.listener.bind_host.trim().is_empty() {
            bail!("listener.bind_host must not be empty");
        }

        if self.listener.bind_port == 0 {
            bail!("listener.bind_port must be greater than 0");
        }

        if self.listener.backlog == 0 || self.listener.backlog > 65535 {
            bail!("listener.backlog must be between 1 and 65535");
        }

        Ok(())
    }

    fn validate_upstream_config(&self) -> Result<()> {
        if self.upstream.host.trim().is_empty() {
            bail!("upstream.host must not be empty");
        }

        if self.upstream.port == 0 {
            bail!("upstream.port must be greater than 0");
        }

        if self.upstream.connect_timeout.is_zero() {
            bail!("upstream.connect_timeout must be greater than 0");
        }

        if self.upstream.connect_timeout > Duration::from_secs(300) {
            bail!("upstream.connect_timeout cannot exceed 5 minutes");
        }

        Ok(())
    }

    fn validate_relay_config(&self) -> Result<()> {
        if self.relay.buffer_size < 512 {
            bail!("relay.buffer_size must be at least 512 bytes");
        }

        if self.relay.buffer_size > 1048576 {
            bail!("relay.buffer_size cannot exceed 1MB");
        }

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.shutdown_timeout > Duration::from_secs(600) {
            bail!("server.shutdown_timeout cannot exceed 10 minutes");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments.
    ///
    /// Returns a description of every override applied, for logging once the
    /// subscriber is installed.
    #[allow(clippy::too_many_arguments)]
    pub fn merge_with_cli_args(
        &mut self,
        bind_host: Option<&str>,
        port: Option<u16>,
        upstream_host: Option<&str>,
        upstream_port: Option<u16>,
        connect_timeout: Option<u64>,
        buffer_size: Option<usize>,
        log_level: Option<&str>,
    ) -> Vec<String> {
        let mut applied = Vec::new();

        if let Some(host) = bind_host {
            self.listener.bind_host = host.to_string();
            applied.push(format!("bind host set to {}", host));
        }

        if let Some(port) = port {
            self.listener.bind_port = port;
            applied.push(format!("bind port set to {}", port));
        }

        if let Some(host) = upstream_host {
            self.upstream.host = host.to_string();
            applied.push(format!("upstream host set to {}", host));
        }

        if let Some(port) = upstream_port {
            self.upstream.port = port;
            applied.push(format!("upstream port set to {}", port));
        }

        if let Some(timeout_secs) = connect_timeout {
            self.upstream.connect_timeout = Duration::from_secs(timeout_secs);
            applied.push(format!("connect timeout set to {}s", timeout_secs));
        }

        if let Some(buffer_size) = buffer_size {
            self.relay.buffer_size = buffer_size;
            applied.push(format!("buffer size set to {} bytes", buffer_size));
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
            applied.push(format!("log level set to {}", level));
        }

        applied
    }
}
