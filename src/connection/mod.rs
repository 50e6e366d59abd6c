//! Connection Management Module
//!
//! Handles TCP connection acceptance, upstream dialing, and per-connection lifecycle.

pub mod listener;
pub mod manager;

pub use listener::{classify_accept_error, AcceptErrorKind, RelayListener};
pub use manager::{ConnectionManager, ConnectionState, ConnectionStats, ShutdownReport};
