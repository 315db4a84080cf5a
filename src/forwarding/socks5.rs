//! SOCKS5 handshake (RFC 1928, no-auth CONNECT subset)

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ssh::{ChannelRejection, TransportError};

/// SOCKS5 protocol constants
#[allow(dead_code)]
pub mod consts {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const CMD_BIND: u8 = 0x02;
    pub const CMD_UDP_ASSOCIATE: u8 = 0x03;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_GENERAL_FAILURE: u8 = 0x01;
    pub const REP_CONN_NOT_ALLOWED: u8 = 0x02;
    pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CONN_REFUSED: u8 = 0x05;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// Per-connection protocol failures; never escalate past the connection
#[derive(Error, Debug)]
pub enum Socks5Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    #[error("Client doesn't offer NO AUTH method")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS5 command: {0}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type: {0}")]
    UnsupportedAddressType(u8),

    #[error("Invalid domain name in request")]
    InvalidDomain,

    #[error("Tunnel channel failed: {0}")]
    Channel(#[from] TransportError),
}

/// Requested CONNECT destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Destination {
    /// Host as sent to the remote side (domains are resolved remotely)
    pub fn host(&self) -> String {
        match self {
            Self::Ip(addr) => addr.ip().to_string(),
            Self::Domain(name, _) => name.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr),
            Self::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

/// Greeting phase: pick "no authentication" or refuse
pub async fn negotiate_method<S>(stream: &mut S) -> Result<(), Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;

    let [version, nmethods] = header;
    if version != consts::VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }

    let mut methods = vec![0u8; nmethods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&consts::AUTH_NONE) {
        stream
            .write_all(&[consts::VERSION, consts::AUTH_NO_ACCEPTABLE])
            .await
            .ok();
        return Err(Socks5Error::NoAcceptableMethod);
    }

    stream.write_all(&[consts::VERSION, consts::AUTH_NONE]).await?;
    Ok(())
}

/// Request phase: read a CONNECT request
///
/// BIND, UDP ASSOCIATE and unknown address types are answered with the
/// matching failure reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<Destination, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER | CMD | RSV | ATYP
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, cmd, _reserved, atyp] = header;

    if version != consts::VERSION {
        return Err(Socks5Error::UnsupportedVersion(version));
    }

    if cmd != consts::CMD_CONNECT {
        send_reply(stream, consts::REP_CMD_NOT_SUPPORTED).await?;
        return Err(Socks5Error::UnsupportedCommand(cmd));
    }

    let destination = match atyp {
        consts::ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Destination::Ip(SocketAddr::new(ip.into(), port))
        }
        consts::ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let name = match std::str::from_utf8(&buf[..len]) {
                Ok(name) if !name.is_empty() => name.to_string(),
                _ => {
                    send_reply(stream, consts::REP_GENERAL_FAILURE).await?;
                    return Err(Socks5Error::InvalidDomain);
                }
            };
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            Destination::Domain(name, port)
        }
        consts::ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Destination::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        other => {
            send_reply(stream, consts::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };

    Ok(destination)
}

/// Send a reply with a placeholder bound address of 0.0.0.0:0
pub async fn send_reply<S>(stream: &mut S, status: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let reply = [
        consts::VERSION,
        status,
        0x00,
        consts::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

/// Reply code for a failed channel open
pub fn reply_code_for(err: &TransportError) -> u8 {
    match err {
        TransportError::ChannelOpen(ChannelRejection::Refused) => consts::REP_CONN_REFUSED,
        TransportError::ChannelOpen(ChannelRejection::Unreachable) => consts::REP_HOST_UNREACHABLE,
        TransportError::ChannelOpen(ChannelRejection::Prohibited) => consts::REP_CONN_NOT_ALLOWED,
        TransportError::Unreachable(_) => consts::REP_HOST_UNREACHABLE,
        _ => consts::REP_GENERAL_FAILURE,
    }
}
