//! Session Settings
//!
//! Tunables for probing, transport retries, liveness detection and listener
//! shutdown. Every field has a serde default so partial JSON files work.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::RetryPolicy;

/// Settings that shape a session's behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Reconnect automatically when the transport dies while proxying
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Health probe timeout in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Transport connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Backoff policy for transport connect attempts
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Application heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat reply timeout in milliseconds
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Consecutive heartbeat timeouts before the peer is declared dead
    #[serde(default = "default_dead_peer_threshold")]
    pub dead_peer_threshold: u32,

    /// SSH protocol keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Unanswered SSH keepalives before russh drops the connection
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// How long `disconnect` lets in-flight relays drain, in milliseconds
    #[serde(default = "default_drain_grace")]
    pub drain_grace_ms: u64,

    /// Reject hosts that are not in known_hosts
    #[serde(default)]
    pub strict_host_key_checking: bool,

    /// Continue connecting when the probe can only report `Unknown`
    #[serde(default)]
    pub proceed_on_unknown: bool,
}

fn default_true() -> bool {
    true
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_heartbeat_interval() -> u64 {
    15_000
}

fn default_ping_timeout() -> u64 {
    5_000
}

fn default_dead_peer_threshold() -> u32 {
    2
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

fn default_drain_grace() -> u64 {
    5_000
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            probe_timeout_secs: default_probe_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            retry: RetryPolicy::default(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            ping_timeout_ms: default_ping_timeout(),
            dead_peer_threshold: default_dead_peer_threshold(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            drain_grace_ms: default_drain_grace(),
            strict_host_key_checking: false,
            proceed_on_unknown: false,
        }
    }
}

impl SessionSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Upper bound on how long a silently dead peer goes unnoticed
    pub fn detection_window(&self) -> Duration {
        (self.heartbeat_interval() + self.ping_timeout()) * self.dead_peer_threshold.max(1)
    }
}
