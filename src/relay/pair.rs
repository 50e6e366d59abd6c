//! Relay Pair
//!
//! Runs the two directional copy loops of one forwarded connection. Both loops
//! share a [`CloseGuard`]; whichever loop finishes first fires it, the other
//! loop is woken out of its pending read or write, and the pair returns only
//! once both loops have been joined.

use std::fmt;
use std::io;
use std::sync::{Arc, OnceLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use super::RelaySession;
use crate::error::RelayError;

/// Direction of a single copy loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToUpstream => "client->upstream",
            Direction::UpstreamToClient => "upstream->client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a relay pair was torn down. Only the first reason is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The source side of `Direction` reached end-of-stream.
    Eof(Direction),
    /// A read or write in `Direction` failed.
    IoError(Direction, io::ErrorKind),
    /// The loop for `Direction` stopped without reporting (panic or abort).
    Aborted(Direction),
    /// The process is shutting down and the grace period ran out.
    Shutdown,
}

impl CloseReason {
    /// True when the pair ended because of a relay I/O failure.
    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::IoError(..) | CloseReason::Aborted(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Eof(direction) => write!(f, "eof ({})", direction),
            CloseReason::IoError(direction, kind) => write!(f, "io error ({}): {}", direction, kind),
            CloseReason::Aborted(direction) => write!(f, "aborted ({})", direction),
            CloseReason::Shutdown => f.write_str("shutdown"),
        }
    }
}

/// Close-once guard shared by the two loops of a relay pair
#[derive(Debug, Default)]
pub struct CloseGuard {
    reason: OnceLock<CloseReason>,
    notify: Notify,
}

impl CloseGuard {
    /// Create a new, open guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` and wake every waiter.
    ///
    /// Returns `true` only for the call that actually closed the guard; every
    /// later or concurrent call is a no-op.
    pub fn close(&self, reason: CloseReason) -> bool {
        if self.reason.set(reason).is_err() {
            return false;
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.reason.get().is_some()
    }

    /// The reason recorded by the first `close` call
    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// Resolve once the guard has been closed
    pub async fn closed(&self) {
        // Registered before the check so a concurrent close cannot slip between them.
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}

/// Fires the guard if a copy loop goes away without reporting a reason.
struct CloseOnDrop {
    guard: Arc<CloseGuard>,
    direction: Direction,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.guard.close(CloseReason::Aborted(self.direction));
    }
}

/// A client connection and its upstream connection, owned together
pub struct RelayPair {
    client: TcpStream,
    upstream: TcpStream,
    buffer_size: usize,
    guard: Arc<CloseGuard>,
}

impl RelayPair {
    /// Create a new relay pair. Nothing is forwarded until [`RelayPair::run`].
    pub fn new(client: TcpStream, upstream: TcpStream, buffer_size: usize) -> Self {
        Self {
            client,
            upstream,
            buffer_size: buffer_size.max(1),
            guard: Arc::new(CloseGuard::new()),
        }
    }

    /// Handle that lets the owner tear the pair down from outside
    pub fn close_handle(&self) -> Arc<CloseGuard> {
        Arc::clone(&self.guard)
    }

    /// Forward bytes in both directions until either side finishes.
    ///
    /// Both sockets are released exactly once, after both loops have returned.
    pub async fn run(self, session: Arc<RelaySession>) -> CloseReason {
        let (client_read, client_write) = self.client.into_split();
        let (upstream_read, upstream_write) = self.upstream.into_split();

        let up = tokio::spawn(copy_direction(
            Direction::ClientToUpstream,
            client_read,
            upstream_write,
            self.buffer_size,
            Arc::clone(&self.guard),
            Arc::clone(&session),
        ));
        let down = tokio::spawn(copy_direction(
            Direction::UpstreamToClient,
            upstream_read,
            client_write,
            self.buffer_size,
            Arc::clone(&self.guard),
            Arc::clone(&session),
        ));

        let (up_result, down_result) = tokio::join!(up, down);
        for (direction, result) in [
            (Direction::ClientToUpstream, up_result),
            (Direction::UpstreamToClient, down_result),
        ] {
            if let Err(e) = result {
                error!(
                    connection_id = %session.connection_id,
                    direction = %direction,
                    "Relay copy task failed: {}", e
                );
            }
        }

        self.guard.reason().unwrap_or(CloseReason::Shutdown)
    }
}

/// One directional copy loop.
///
/// Reads at most `buffer_size` bytes at a time and writes them out unchanged,
/// in order. Stops on end-of-stream, on the first I/O error, or when the
/// guard is closed by the opposite loop or by the owner.
pub async fn copy_direction<R, W>(
    direction: Direction,
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    guard: Arc<CloseGuard>,
    session: Arc<RelaySession>,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let _close_on_drop = CloseOnDrop {
        guard: Arc::clone(&guard),
        direction,
    };
    let mut buf = vec![0u8; buffer_size];
    let mut forwarded: u64 = 0;

    let reason = loop {
        let step = async {
            let n = reader.read(&mut buf).await?;
            if n > 0 {
                writer.write_all(&buf[..n]).await?;
            }
            Ok::<usize, io::Error>(n)
        };

        tokio::select! {
            biased;
            _ = guard.closed() => break None,
            result = step => match result {
                Ok(0) => break Some(CloseReason::Eof(direction)),
                Ok(n) => {
                    forwarded += n as u64;
                    session.add_bytes(direction, n as u64);
                }
                Err(source) => {
                    let kind = source.kind();
                    let err = RelayError::RelayIo {
                        direction: direction.as_str(),
                        source,
                    };
                    if matches!(kind, io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe) {
                        debug!(connection_id = %session.connection_id, "{}", err);
                    } else {
                        warn!(connection_id = %session.connection_id, "{}", err);
                    }
                    break Some(CloseReason::IoError(direction, kind));
                }
            }
        }
    };

    match reason {
        Some(reason) => {
            if guard.close(reason) {
                debug!(
                    connection_id = %session.connection_id,
                    "Relay closing: {}", reason
                );
            }
        }
        None => debug!(
            connection_id = %session.connection_id,
            direction = %direction,
            "Copy loop stopped by close guard"
        ),
    }

    forwarded
}
