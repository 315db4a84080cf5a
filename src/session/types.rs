//! Session Types and Data Structures

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::forwarding::{ForwardStats, ListenError};
use crate::probe::{InstanceState, ProbeError};
use crate::ssh::TransportError;

/// Session lifecycle state
///
/// ```text
/// Idle ─connect─▶ Probing ─▶ Connecting ─▶ Proxying
///   ▲                │            │            │ transport lost
///   │                ▼            ▼            ▼
///   └──disconnect── Idle/Failed ◀──────── Failed ─auto─▶ Reconnecting ─▶ Proxying
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Probing,
    Connecting,
    Proxying,
    /// Backing off between automatic reconnect attempts
    Reconnecting,
    Failed,
}

impl SessionState {
    /// A connect or reconnect is under way, or the proxy is serving
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Probing | Self::Connecting | Self::Proxying | Self::Reconnecting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Idle => "idle",
            Self::Probing => "probing",
            Self::Connecting => "connecting",
            Self::Proxying => "proxying",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// The one error type callers of the session manager see
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid profile: {0}")]
    Config(#[from] ConfigError),

    #[error("Health probe failed: {0}")]
    Probe(#[from] ProbeError),

    #[error("Instance is not running (state: {0})")]
    InstanceNotRunning(InstanceState),

    #[error("Tunnel failed: {0}")]
    TransportFailed(#[from] TransportError),

    #[error("Local port already in use: {0}")]
    PortInUse(String),

    #[error("Cannot open local proxy: {0}")]
    Listen(ListenError),

    #[error("A session is already active")]
    AlreadyActive,
}

impl From<ListenError> for SessionError {
    fn from(err: ListenError) -> Self {
        match err {
            ListenError::AddrInUse(addr) => SessionError::PortInUse(addr),
            other => SessionError::Listen(other),
        }
    }
}

impl Serialize for SessionError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Kept until the next successful connect
    pub last_error: Option<SessionError>,
    /// Time spent in the current `Proxying` stretch
    pub uptime: Option<Duration>,
    /// Transport attempts made by the current connect or reconnect
    pub retry_count: u32,
    /// Bound SOCKS5 address while proxying
    pub proxy_address: Option<SocketAddr>,
    pub stats: ForwardStats,
}

impl SessionStatus {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            last_error: None,
            uptime: None,
            retry_count: 0,
            proxy_address: None,
            stats: ForwardStats::default(),
        }
    }
}
