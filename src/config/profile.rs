//! Connection Profile
//!
//! The parameters needed to reach one remote instance and expose it locally:
//! target host (or cloud instance identifier), SSH identity, region and the
//! local SOCKS5 bind address.

use std::net::{IpAddr, Ipv6Addr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Default local SOCKS5 port
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Profile validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Private key unreadable at {path}: {reason}")]
    UnreadableKey { path: String, reason: String },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}

impl Serialize for ConfigError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Remote target, derived from the profile's host field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target<'a> {
    /// DNS name or IP literal, dialed directly
    Address(&'a str),
    /// Cloud instance identifier, resolved through the health prober
    Instance(&'a str),
}

/// Connection profile for one tunnel session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProfile {
    /// Host address or cloud instance identifier (e.g. `i-0abc12345def67890`)
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// SSH username
    pub username: String,

    /// Path to the private key file
    pub key_path: PathBuf,

    /// Optional passphrase for encrypted keys
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_passphrase: Option<String>,

    /// Remote region or zone, used by the cloud health probe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Local address the SOCKS5 proxy binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Local SOCKS5 port
    #[serde(default = "default_proxy_port")]
    pub bind_port: u16,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}

impl ConnectionProfile {
    /// Create a profile with default ports and loopback bind address
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            ssh_port: default_ssh_port(),
            username: username.into(),
            key_path: key_path.into(),
            key_passphrase: None,
            region: None,
            bind_address: default_bind_address(),
            bind_port: DEFAULT_PROXY_PORT,
        }
    }

    /// Set the remote region
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the local SOCKS5 port
    pub fn with_bind_port(mut self, port: u16) -> Self {
        self.bind_port = port;
        self
    }

    /// Set the SSH port
    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = port;
        self
    }

    /// Classify the host field
    ///
    /// A bracketed IPv6 literal comes back without its brackets.
    pub fn target(&self) -> Target<'_> {
        let host = self.host.trim();
        if is_instance_id(host) {
            Target::Instance(host)
        } else {
            Target::Address(unbracket(host))
        }
    }

    /// Local `address:port` for the SOCKS5 listener
    pub fn bind_addr(&self) -> String {
        match self.bind_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.bind_port),
            _ => format!("{}:{}", self.bind_address, self.bind_port),
        }
    }

    /// Whether two profiles point at the same tunnel endpoint
    pub fn same_tunnel(&self, other: &ConnectionProfile) -> bool {
        self.host.trim() == other.host.trim()
            && self.ssh_port == other.ssh_port
            && self.username == other.username
            && self.key_path == other.key_path
    }

    /// Validate the profile before a connect attempt
    ///
    /// Only reads the filesystem; never touches the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::MissingField("host"));
        }
        if self.username.trim().is_empty() {
            return Err(ConfigError::MissingField("username"));
        }
        if self.key_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("key_path"));
        }
        if self.bind_port == 0 {
            return Err(ConfigError::MissingField("bind_port"));
        }
        if self.ssh_port == 0 {
            return Err(ConfigError::InvalidAddress("ssh port 0".into()));
        }

        match self.target() {
            Target::Instance(_) => {}
            Target::Address(host) => {
                if !is_valid_host(host) {
                    return Err(ConfigError::InvalidAddress(host.to_string()));
                }
            }
        }

        if self.bind_address.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidAddress(format!(
                "bind address {}",
                self.bind_address
            )));
        }

        check_key_file(&self.key_path)
    }
}

/// `i-` followed by 8 or 17 lowercase hex digits
pub fn is_instance_id(s: &str) -> bool {
    match s.strip_prefix("i-") {
        Some(rest) => {
            (rest.len() == 8 || rest.len() == 17)
                && rest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        }
        None => false,
    }
}

/// `[::1]` -> `::1`; anything else is returned as is
fn unbracket(host: &str) -> &str {
    match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(inner) if inner.parse::<Ipv6Addr>().is_ok() => inner,
        _ => host,
    }
}

/// IP literal (optionally bracketed IPv6) or RFC 1123 host name
fn is_valid_host(host: &str) -> bool {
    if unbracket(host).parse::<IpAddr>().is_ok() {
        return true;
    }
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    host.trim_end_matches('.').split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn check_key_file(path: &Path) -> Result<(), ConfigError> {
    let unreadable = |reason: String| ConfigError::UnreadableKey {
        path: path.display().to_string(),
        reason,
    };

    let metadata = std::fs::metadata(path).map_err(|e| unreadable(e.to_string()))?;
    if !metadata.is_file() {
        return Err(unreadable("not a regular file".into()));
    }
    std::fs::File::open(path).map_err(|e| unreadable(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!(
                "Private key {} has permissions {:o}; expected 600 or stricter",
                path.display(),
                mode
            );
        }
    }

    debug!("Private key {} is readable", path.display());
    Ok(())
}
