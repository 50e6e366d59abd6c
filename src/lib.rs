//! tunrelay Library
//!
//! A local TCP relay: accepts connections on one local port and forwards each
//! one, byte for byte and in both directions, to a fixed upstream endpoint such
//! as the local end of an SSH tunnel.

pub mod config;
pub mod connection;
pub mod error;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use connection::{ConnectionManager, RelayListener};
pub use error::RelayError;
pub use shutdown::ShutdownCoordinator;

/// Common error type for configuration and process setup
pub type Result<T> = anyhow::Result<T>;
