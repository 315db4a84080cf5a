//! SSH module - the encrypted transport to the remote instance
//!
//! # Features
//! - Public key authentication only
//! - Host key verification via ~/.ssh/known_hosts
//! - Single-owner connection task with a cloneable controller
//! - `direct-tcpip` channels multiplexed over one connection
//! - Keepalive heartbeat with hard/soft failure distinction

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod tunnel;

pub use client::{ClientHandler, SshClient};
pub use config::TransportConfig;
pub use error::{ChannelRejection, TransportError};
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, OwnedHandle, PingResult,
};
pub use known_hosts::{HostKeyVerification, KnownHostsStore};
pub use tunnel::{
    ChannelOpener, ChannelView, SshConnector, SshTunnel, Tunnel, TunnelConnector, TunnelIo,
    TunnelStream,
};
