//! Tunnel abstraction
//!
//! The session layer and the SOCKS5 front talk to the SSH connection through
//! these traits. `SshConnector`/`SshTunnel` are the russh-backed
//! implementations.
//!
//! ```text
//!  SessionManager ──owns──▶ Arc<dyn Tunnel> ──ping/close/subscribe
//!        │
//!        └─ ChannelView ──▶ SOCKS5 relay tasks (open_channel only)
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::{debug, info};

use super::client::SshClient;
use super::config::TransportConfig;
use super::error::TransportError;
use super::handle_owner::{spawn_handle_owner_task, HandleController, PingResult};
use super::known_hosts::KnownHostsStore;

/// Byte stream carried by one tunnel channel
pub trait TunnelIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Opens forwarded channels; the only capability relay tasks get
#[async_trait]
pub trait ChannelOpener: Send + Sync {
    /// Open a channel to `host:port` on the remote side
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<TunnelStream, TransportError>;
}

/// An established transport, owned by the session
#[async_trait]
pub trait Tunnel: ChannelOpener {
    /// Identifier for logs
    fn id(&self) -> &str;

    /// Heartbeat round trip
    async fn ping(&self) -> PingResult;

    /// Fires once the transport is gone
    fn subscribe_disconnect(&self) -> broadcast::Receiver<()>;

    fn is_connected(&self) -> bool;

    /// Tear the transport down
    async fn close(&self);
}

/// Produces tunnels; one call per connect attempt
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(&self, config: TransportConfig) -> Result<Arc<dyn Tunnel>, TransportError>;
}

/// Channel-only view of a tunnel
///
/// Handed to the SOCKS5 front so relay tasks cannot close or reconfigure the
/// transport.
pub struct ChannelView(Arc<dyn Tunnel>);

impl ChannelView {
    pub fn new(tunnel: Arc<dyn Tunnel>) -> Self {
        Self(tunnel)
    }
}

#[async_trait]
impl ChannelOpener for ChannelView {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<TunnelStream, TransportError> {
        self.0.open_channel(host, port, originator).await
    }
}

/// russh-backed tunnel
pub struct SshTunnel {
    id: String,
    controller: HandleController,
}

#[async_trait]
impl ChannelOpener for SshTunnel {
    async fn open_channel(
        &self,
        host: &str,
        port: u16,
        originator: SocketAddr,
    ) -> Result<TunnelStream, TransportError> {
        let channel = self
            .controller
            .open_direct_tcpip(
                host,
                port as u32,
                &originator.ip().to_string(),
                originator.port() as u32,
            )
            .await?;
        debug!("Tunnel {}: direct-tcpip channel open to {}:{}", self.id, host, port);
        Ok(Box::new(channel.into_stream()))
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn ping(&self) -> PingResult {
        self.controller.ping().await
    }

    fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    async fn close(&self) {
        info!("Closing tunnel {}", self.id);
        self.controller.disconnect().await;
    }
}

/// Connects real SSH tunnels
pub struct SshConnector {
    known_hosts: Arc<KnownHostsStore>,
    ping_timeout: Duration,
}

impl SshConnector {
    pub fn new(known_hosts: Arc<KnownHostsStore>, ping_timeout: Duration) -> Self {
        Self {
            known_hosts,
            ping_timeout,
        }
    }
}

#[async_trait]
impl TunnelConnector for SshConnector {
    async fn connect(&self, config: TransportConfig) -> Result<Arc<dyn Tunnel>, TransportError> {
        let handle = SshClient::new(config, self.known_hosts.clone()).connect().await?;
        let id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, id.clone(), self.ping_timeout);
        Ok(Arc::new(SshTunnel { id, controller }))
    }
}
