//! SSH Transport Configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{ConnectionProfile, SessionSettings};

/// Everything the transport needs for one connect attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Resolved remote address (DNS name or IP)
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Path to private key file
    pub key_path: PathBuf,

    /// Optional passphrase for encrypted keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// SSH keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,

    /// Missed keepalives before the connection is dropped
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// Strict host key checking (default: false)
    /// - true: reject connections to unknown hosts
    /// - false: auto-accept unknown hosts, still reject changed keys
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    15
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_max() -> usize {
    3
}

impl TransportConfig {
    /// Build from a profile and the address it resolved to
    pub fn from_profile(
        profile: &ConnectionProfile,
        address: &str,
        settings: &SessionSettings,
    ) -> Self {
        Self {
            host: address.to_string(),
            port: profile.ssh_port,
            username: profile.username.clone(),
            key_path: profile.key_path.clone(),
            passphrase: profile.key_passphrase.clone(),
            timeout_secs: settings.connect_timeout_secs,
            keepalive_interval_secs: settings.keepalive_interval_secs,
            keepalive_max: settings.keepalive_max,
            strict_host_key_checking: settings.strict_host_key_checking,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Keepalive is disabled when the interval is zero
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    /// `host:port` with IPv6 literals bracketed
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
