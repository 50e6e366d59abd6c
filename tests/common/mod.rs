//! Shared helpers for relay integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use tunrelay::{Config, ConnectionManager, RelayError, RelayListener};

pub const WAIT: Duration = Duration::from_secs(5);

/// Relay config that binds an ephemeral loopback port and forwards to `upstream_port`.
pub fn test_config(upstream_port: u16) -> Config {
    let mut config = Config::default();
    config.listener.bind_port = 0;
    config.upstream.port = upstream_port;
    config.upstream.connect_timeout = Duration::from_secs(1);
    config.server.shutdown_timeout = Duration::from_millis(500);
    config
}

pub struct RunningRelay {
    pub manager: Arc<ConnectionManager>,
    pub addr: SocketAddr,
    pub handle: JoinHandle<Result<(), RelayError>>,
}

/// Bind and start serving; returns once the listener is bound.
pub async fn start_relay(config: Config) -> RunningRelay {
    let listener = RelayListener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr();
    let manager = Arc::new(ConnectionManager::new(Arc::new(config)));

    let handle = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.serve(listener).await })
    };

    RunningRelay {
        manager,
        addr,
        handle,
    }
}

/// A port with nothing listening on it.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Echo server that serves every connection until the peer closes.
pub async fn spawn_echo_upstream() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, spawn_echo_on(listener))
}

pub fn spawn_echo_on(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    })
}

/// Deterministic, non-repeating-looking payload.
pub fn payload(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(2654435761).wrapping_add(1);
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Poll `check` until it holds or `WAIT` elapses.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
