//! Transport Error types

use std::fmt;

use thiserror::Error;

/// Why the remote side refused a forwarded channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRejection {
    /// Destination actively refused the connection
    Refused,
    /// Destination could not be reached from the remote host
    Unreachable,
    /// Remote policy forbids the forward
    Prohibited,
    /// Any other failure (resource shortage, unknown channel type)
    Other,
}

impl fmt::Display for ChannelRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Refused => "connection refused",
            Self::Unreachable => "destination unreachable",
            Self::Prohibited => "administratively prohibited",
            Self::Other => "rejected",
        };
        f.write_str(text)
    }
}

impl From<russh::ChannelOpenFailure> for ChannelRejection {
    fn from(reason: russh::ChannelOpenFailure) -> Self {
        match reason {
            // OpenSSH reports refused and unreachable destinations alike
            russh::ChannelOpenFailure::ConnectFailed => Self::Unreachable,
            russh::ChannelOpenFailure::AdministrativelyProhibited => Self::Prohibited,
            _ => Self::Other,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Key error: {0}")]
    KeyRejected(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Host unreachable: {0}")]
    Unreachable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Channel open failed: {0}")]
    ChannelOpen(ChannelRejection),

    #[error("Disconnected")]
    Disconnected,
}

impl TransportError {
    /// Whether another connect attempt may succeed
    ///
    /// Credential and host key problems never fix themselves.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::AuthFailed(_) | Self::KeyRejected(_) | Self::HostKeyRejected(_)
        )
    }
}

impl From<russh::Error> for TransportError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::IO(e) => TransportError::Unreachable(e.to_string()),
            russh::Error::Disconnect => TransportError::Disconnected,
            russh::Error::ChannelOpenFailure(reason) => TransportError::ChannelOpen(reason.into()),
            other => TransportError::HandshakeFailed(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for TransportError {
    fn from(err: russh::keys::Error) -> Self {
        TransportError::KeyRejected(err.to_string())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => TransportError::Timeout(err.to_string()),
            _ => TransportError::Unreachable(err.to_string()),
        }
    }
}

// Exported through the session status as its display string
impl serde::Serialize for TransportError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
