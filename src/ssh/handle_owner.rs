//! Handle Owner Task
//!
//! Implements the "single owner" pattern for the SSH `Handle`.
//!
//! Only one task owns the `Handle<ClientHandler>`. Relay tasks and the
//! session supervisor talk to it through a cloneable `HandleController`
//! that sends commands over an mpsc channel, so concurrent channel-open
//! requests never contend on a lock held across `.await`.
//!
//! The owner never awaits a remote round trip inline: every channel open
//! and keepalive runs in its own task and replies over its oneshot. A
//! destination that takes minutes to answer holds up only its own caller.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, session_id, ping_timeout);
//! let channel = controller.open_direct_tcpip("example.com", 443, "127.0.0.1", 50000).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::TransportError;

/// How often the owner checks whether the connection died underneath it
const CLOSED_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Heartbeat outcome, separating soft and hard failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    /// Peer answered
    Ok,
    /// No answer in time (may be latency, counts toward the dead-peer threshold)
    Timeout,
    /// Connection is gone
    IoError,
}

/// Connection operations the owner task drives
///
/// Every method takes `&self`; the owner shares the handle with the
/// per-request tasks it spawns.
#[async_trait]
pub trait OwnedHandle: Send + Sync + 'static {
    type Channel: Send + 'static;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Self::Channel, russh::Error>;

    /// `keepalive@openssh.com` with want_reply=true
    async fn keepalive(&self) -> Result<(), russh::Error>;

    fn connection_closed(&self) -> bool;

    async fn shutdown(&self);
}

#[async_trait]
impl OwnedHandle for Handle<ClientHandler> {
    type Channel = Channel<Msg>;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    async fn keepalive(&self) -> Result<(), russh::Error> {
        self.send_keepalive(true).await
    }

    fn connection_closed(&self) -> bool {
        self.is_closed()
    }

    async fn shutdown(&self) {
        let _ = self
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand<C = Channel<Msg>> {
    /// Open a direct-tcpip channel (dynamic forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<C, russh::Error>>,
    },

    /// Heartbeat probe
    Ping { reply_tx: oneshot::Sender<PingResult> },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning only copies the senders. Holding a controller means holding full
/// control of the connection, so it never leaves the session layer; relay
/// tasks see it only through the channel-opening trait.
pub struct HandleController<C = Channel<Msg>> {
    cmd_tx: mpsc::Sender<HandleCommand<C>>,
    disconnect_tx: broadcast::Sender<()>,
}

impl<C> Clone for HandleController<C> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            disconnect_tx: self.disconnect_tx.clone(),
        }
    }
}

impl<C: Send + 'static> HandleController<C> {
    /// Subscribe to SSH disconnect notifications
    ///
    /// The receiver gets `()` (or `Closed`) once the owner task has stopped
    /// accepting commands.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel toward `host:port`
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<C, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| TransportError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| TransportError::Disconnected)?
            .map_err(TransportError::from)
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Send a keepalive that requires a reply
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes the handle and returns a controller. The task exits when
/// `Disconnect` is received, when every controller is dropped, when a
/// keepalive finds the connection gone, or when the periodic check sees the
/// connection closed by the peer. Subscribers are notified in every case,
/// after the command queue has been closed.
pub fn spawn_handle_owner_task<H: OwnedHandle>(
    handle: H,
    session_id: String,
    ping_timeout: Duration,
) -> HandleController<H::Channel> {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand<H::Channel>>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let handle = Arc::new(handle);
        // Cancelled when the owner stops; in-flight requests fail with it
        let closing = CancellationToken::new();
        let mut closed_check = tokio::time::interval(CLOSED_CHECK_INTERVAL);
        closed_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("All controllers dropped for session {}", session_id);
                        break;
                    };
                    match cmd {
                        HandleCommand::ChannelOpenDirectTcpip {
                            host,
                            port,
                            originator_host,
                            originator_port,
                            reply_tx,
                        } => {
                            let handle = handle.clone();
                            let closing = closing.clone();
                            tokio::spawn(async move {
                                let result = tokio::select! {
                                    result = handle.open_direct_tcpip(&host, port, &originator_host, originator_port) => result,
                                    _ = closing.cancelled() => Err(russh::Error::Disconnect),
                                };
                                if reply_tx.send(result).is_err() {
                                    // Channel is dropped here; the server closes it
                                    warn!("Caller dropped before receiving direct_tcpip result");
                                }
                            });
                        }

                        HandleCommand::Ping { reply_tx } => {
                            let handle = handle.clone();
                            let closing = closing.clone();
                            let session_id = session_id.clone();
                            tokio::spawn(async move {
                                let result = ping_handle(handle.as_ref(), &session_id, ping_timeout).await;
                                if result == PingResult::IoError {
                                    closing.cancel();
                                }
                                let _ = reply_tx.send(result);
                            });
                        }

                        HandleCommand::Disconnect => {
                            info!("Disconnect requested for session {}", session_id);
                            break;
                        }
                    }
                }

                _ = closing.cancelled() => {
                    warn!("Keepalive found session {} disconnected", session_id);
                    break;
                }

                _ = closed_check.tick() => {
                    if handle.connection_closed() {
                        warn!("SSH connection for session {} closed by peer", session_id);
                        break;
                    }
                }
            }
        }

        closing.cancel();
        drain_pending_commands(&mut cmd_rx);
        let _ = disconnect_tx_clone.send(());

        handle.shutdown().await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

async fn ping_handle<H: OwnedHandle>(handle: &H, session_id: &str, ping_timeout: Duration) -> PingResult {
    if handle.connection_closed() {
        warn!("Keepalive for session {}: connection already closed", session_id);
        return PingResult::IoError;
    }

    debug!("Keepalive probe for session {}", session_id);
    match tokio::time::timeout(ping_timeout, handle.keepalive()).await {
        Ok(Ok(())) => {
            debug!("Keepalive OK for session {}", session_id);
            PingResult::Ok
        }
        Ok(Err(russh::Error::Disconnect)) => {
            warn!("Keepalive for session {}: peer disconnected", session_id);
            PingResult::IoError
        }
        Ok(Err(e)) => {
            warn!(
                "Keepalive SSH error for session {} (treating as soft failure): {:?}",
                session_id, e
            );
            PingResult::Timeout
        }
        Err(_) => {
            warn!(
                "Keepalive timeout for session {} ({}ms)",
                session_id,
                ping_timeout.as_millis()
            );
            PingResult::Timeout
        }
    }
}

/// Fail every queued command with a disconnect
fn drain_pending_commands<C>(cmd_rx: &mut mpsc::Receiver<HandleCommand<C>>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Stands in for a russh handle; one destination never answers
    #[derive(Default)]
    struct ScriptedHandle {
        closed: Arc<AtomicBool>,
        keepalive_lost: Arc<AtomicBool>,
        shutdowns: Arc<AtomicUsize>,
    }

    const STALLED_HOST: &str = "10.255.255.1";

    #[async_trait]
    impl OwnedHandle for ScriptedHandle {
        type Channel = String;

        async fn open_direct_tcpip(
            &self,
            host: &str,
            port: u32,
            _originator_host: &str,
            _originator_port: u32,
        ) -> Result<String, russh::Error> {
            if host == STALLED_HOST {
                std::future::pending::<()>().await;
            }
            Ok(format!("{}:{}", host, port))
        }

        async fn keepalive(&self) -> Result<(), russh::Error> {
            if self.keepalive_lost.load(Ordering::SeqCst) {
                Err(russh::Error::Disconnect)
            } else {
                Ok(())
            }
        }

        fn connection_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    const STEP: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn test_slow_open_does_not_block_other_requests() {
        let controller =
            spawn_handle_owner_task(ScriptedHandle::default(), "s1".into(), Duration::from_secs(1));

        let stalled = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .open_direct_tcpip(STALLED_HOST, 80, "127.0.0.1", 40000)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let channel = tokio::time::timeout(
            STEP,
            controller.open_direct_tcpip("example.com", 443, "127.0.0.1", 40001),
        )
        .await
        .expect("second open queued behind the stalled one")
        .unwrap();
        assert_eq!(channel, "example.com:443");

        for _ in 0..3 {
            let result = tokio::time::timeout(STEP, controller.ping())
                .await
                .expect("ping queued behind the stalled open");
            assert_eq!(result, PingResult::Ok);
        }

        controller.disconnect().await;
        let result = tokio::time::timeout(STEP, stalled).await.unwrap().unwrap();
        assert_eq!(result, Err(TransportError::Disconnected));
    }

    #[tokio::test]
    async fn test_peer_close_noticed_without_ping() {
        let handle = ScriptedHandle::default();
        let closed = handle.closed.clone();
        let shutdowns = handle.shutdowns.clone();
        let controller = spawn_handle_owner_task(handle, "s2".into(), Duration::from_secs(1));
        let mut disconnected = controller.subscribe_disconnect();
        assert!(controller.is_connected());

        closed.store(true, Ordering::SeqCst);

        tokio::time::timeout(STEP, disconnected.recv())
            .await
            .expect("owner did not notice the closed connection")
            .unwrap();
        assert!(!controller.is_connected());
        assert_eq!(
            controller
                .open_direct_tcpip("example.com", 80, "127.0.0.1", 40002)
                .await,
            Err(TransportError::Disconnected)
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_lost_keepalive_ends_owner() {
        let handle = ScriptedHandle::default();
        handle.keepalive_lost.store(true, Ordering::SeqCst);
        let controller = spawn_handle_owner_task(handle, "s3".into(), Duration::from_secs(1));
        let mut disconnected = controller.subscribe_disconnect();

        assert_eq!(controller.ping().await, PingResult::IoError);
        tokio::time::timeout(STEP, disconnected.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_commands_after_disconnect_fail() {
        let controller =
            spawn_handle_owner_task(ScriptedHandle::default(), "s4".into(), Duration::from_secs(1));
        let mut disconnected = controller.subscribe_disconnect();

        controller.disconnect().await;
        assert_eq!(controller.ping().await, PingResult::IoError);
        assert_eq!(
            controller
                .open_direct_tcpip("example.com", 80, "127.0.0.1", 40003)
                .await,
            Err(TransportError::Disconnected)
        );
        tokio::time::timeout(STEP, disconnected.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropping_controllers_ends_owner() {
        let handle = ScriptedHandle::default();
        let shutdowns = handle.shutdowns.clone();
        let controller = spawn_handle_owner_task(handle, "s5".into(), Duration::from_secs(1));
        drop(controller);

        tokio::time::timeout(STEP, async {
            while shutdowns.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("owner kept running without controllers");
    }
}
