//! Data Relay Module
//!
//! Upstream dialing and bidirectional forwarding between client and upstream.

pub mod dialer;
pub mod pair;
pub mod session;

pub use dialer::UpstreamDialer;
pub use pair::{CloseGuard, CloseReason, Direction, RelayPair};
pub use session::{RelayReport, RelaySession};
