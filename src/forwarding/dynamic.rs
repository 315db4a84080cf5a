//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Local SOCKS5 listener whose CONNECT requests are carried over the tunnel.
//! Example: 127.0.0.1:8080 -> SSH tunnel -> any destination the instance can reach

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::socks5::{self, consts, Socks5Error};
use crate::ssh::ChannelOpener;

/// Forward statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (to remote)
    pub bytes_sent: u64,
    /// Total bytes received (from remote)
    pub bytes_received: u64,
}

/// Why the local listener could not be opened
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ListenError {
    #[error("Port already in use: {0}. Another application may be using this port.")]
    AddrInUse(String),

    #[error("Permission denied binding to {0}. Ports below 1024 require elevated privileges.")]
    PermissionDenied(String),

    #[error("Address not available: {0}. The specified address is not valid on this system.")]
    AddrNotAvailable(String),

    #[error("Failed to bind SOCKS5 proxy to {addr}: {reason}")]
    Io { addr: String, reason: String },
}

impl ListenError {
    fn from_io(addr: &str, e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::AddrInUse => Self::AddrInUse(addr.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(addr.to_string()),
            std::io::ErrorKind::AddrNotAvailable => Self::AddrNotAvailable(addr.to_string()),
            _ => Self::Io {
                addr: addr.to_string(),
                reason: e.to_string(),
            },
        }
    }
}

/// Handle to a running SOCKS5 proxy
///
/// Dropping the handle cancels the accept loop and every relay.
pub struct DynamicForwardHandle {
    /// Actual bound address
    pub bound_addr: SocketAddr,
    /// Stops accepting
    shutdown: CancellationToken,
    /// Tears down in-flight relays
    relays: CancellationToken,
    tracker: TaskTracker,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<RwLock<ForwardStats>>,
}

impl DynamicForwardHandle {
    /// Stop the SOCKS5 proxy
    ///
    /// The listener is closed immediately. Active relays get `grace` to
    /// finish on their own, then are cancelled. Returns once the port is
    /// released and every relay task has exited.
    pub async fn stop(&self, grace: Duration) {
        info!("Stopping SOCKS5 proxy on {}", self.bound_addr);
        self.shutdown.cancel();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }

        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                "Timeout waiting for {} active connections to close on {}",
                self.stats.read().active_connections,
                self.bound_addr
            );
            self.relays.cancel();
            self.tracker.wait().await;
        }

        info!("SOCKS5 proxy on {} stopped", self.bound_addr);
    }

    /// Check if the proxy is still accepting
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Get current stats
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    /// Shared stats cell, readable after the handle is gone
    pub fn stats_source(&self) -> Arc<RwLock<ForwardStats>> {
        self.stats.clone()
    }
}

impl std::fmt::Debug for DynamicForwardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicForwardHandle")
            .field("bound_addr", &self.bound_addr)
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for DynamicForwardHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.relays.cancel();
    }
}

/// Start dynamic (SOCKS5) port forwarding
///
/// This function:
/// 1. Binds the local listener (failure is reported, nothing is left running)
/// 2. For each incoming connection, performs the SOCKS5 handshake
/// 3. Opens a channel through the tunnel to the requested destination
/// 4. Relays bytes between the local socket and the channel
pub async fn start_dynamic_forward(
    bind_addr: &str,
    opener: Arc<dyn ChannelOpener>,
) -> Result<DynamicForwardHandle, ListenError> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| ListenError::from_io(bind_addr, e))?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| ListenError::from_io(bind_addr, e))?;

    info!("Started SOCKS5 proxy on {}", bound_addr);

    let shutdown = CancellationToken::new();
    let relays = CancellationToken::new();
    let tracker = TaskTracker::new();
    let stats = Arc::new(RwLock::new(ForwardStats::default()));

    let accept_task = tokio::spawn(accept_loop(
        listener,
        opener,
        shutdown.clone(),
        relays.clone(),
        tracker.clone(),
        stats.clone(),
    ));

    Ok(DynamicForwardHandle {
        bound_addr,
        shutdown,
        relays,
        tracker,
        accept_task: Mutex::new(Some(accept_task)),
        stats,
    })
}

async fn accept_loop(
    listener: TcpListener,
    opener: Arc<dyn ChannelOpener>,
    shutdown: CancellationToken,
    relays: CancellationToken,
    tracker: TaskTracker,
    stats: Arc<RwLock<ForwardStats>>,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("SOCKS5 proxy stopped by request");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        // Disable Nagle's algorithm for low-latency proxying
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("SOCKS5: Accepted connection from {}", peer_addr);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let opener = opener.clone();
                        let stats_for_conn = stats.clone();
                        let relay_cancel = relays.clone();

                        tracker.spawn(async move {
                            let result = tokio::select! {
                                r = handle_socks5_connection(opener, stream, peer_addr, stats_for_conn.clone()) => r,
                                _ = relay_cancel.cancelled() => {
                                    debug!("SOCKS5: relay for {} cancelled", peer_addr);
                                    Ok(())
                                }
                            };

                            {
                                let mut s = stats_for_conn.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }

                            if let Err(e) = result {
                                warn!("SOCKS5 connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("SOCKS5 accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    // Listener dropped here, port released
    info!("SOCKS5 accept loop exited");
}

/// Handle a single SOCKS5 connection
async fn handle_socks5_connection(
    opener: Arc<dyn ChannelOpener>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    stats: Arc<RwLock<ForwardStats>>,
) -> Result<(), Socks5Error> {
    // Phase 1: method negotiation
    socks5::negotiate_method(&mut stream).await?;

    // Phase 2: CONNECT request
    let destination = socks5::read_request(&mut stream).await?;
    debug!("SOCKS5: {} requests {}", peer_addr, destination);

    // Phase 3: open the tunnel channel
    let mut channel = match opener
        .open_channel(&destination.host(), destination.port(), peer_addr)
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            let code = socks5::reply_code_for(&e);
            debug!(
                "SOCKS5: channel to {} failed ({}), replying {:#04x}",
                destination, e, code
            );
            socks5::send_reply(&mut stream, code).await.ok();
            return Err(Socks5Error::Channel(e));
        }
    };

    socks5::send_reply(&mut stream, consts::REP_SUCCESS).await?;
    debug!("SOCKS5: Connected to {} via tunnel", destination);

    // Phase 4: relay until both directions are done or one side errors
    let result = tokio::io::copy_bidirectional(&mut stream, &mut channel).await;

    match result {
        Ok((sent, received)) => {
            let mut s = stats.write();
            s.bytes_sent += sent;
            s.bytes_received += received;
            debug!(
                "SOCKS5: relay {} <-> {} closed ({} bytes out, {} bytes in)",
                peer_addr, destination, sent, received
            );
            Ok(())
        }
        Err(e) => {
            debug!("SOCKS5: relay {} <-> {} ended: {}", peer_addr, destination, e);
            Ok(())
        }
    }
}
