//! Configuration Module
//!
//! Handles configuration loading, validation, and CLI/environment overrides.

pub mod manager;
pub mod types;

pub use manager::{ConfigManager, ConfigSource};
pub use types::*;
