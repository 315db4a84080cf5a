//! SSH Client implementation using russh

use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use tracing::{debug, info, warn};

use super::config::TransportConfig;
use super::error::TransportError;
use super::known_hosts::{HostKeyVerification, KnownHostsStore};

/// One-shot SSH connector: resolve, handshake, authenticate with a key
pub struct SshClient {
    config: TransportConfig,
    known_hosts: Arc<KnownHostsStore>,
}

impl SshClient {
    pub fn new(config: TransportConfig, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            config,
            known_hosts,
        }
    }

    /// Connect and authenticate, returning the raw handle
    ///
    /// Only public key authentication is attempted.
    pub async fn connect(self) -> Result<Handle<ClientHandler>, TransportError> {
        let addr = self.config.addr();
        let timeout = self.config.timeout();

        // Load the key first: a bad key is fatal and needs no network round trip
        let key = russh::keys::load_secret_key(&self.config.key_path, self.config.passphrase.as_deref())
            .map_err(|e| {
                TransportError::KeyRejected(format!("{}: {}", self.config.key_path.display(), e))
            })?;

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = tokio::time::timeout(timeout, tokio::net::lookup_host(addr.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(format!("Resolving {} timed out", addr)))?
            .map_err(|e| TransportError::Unreachable(format!("Failed to resolve {}: {}", addr, e)))?
            .next()
            .ok_or_else(|| TransportError::Unreachable(format!("No address found for {}", addr)))?;

        let ssh_config = client::Config {
            // Liveness is the session supervisor's job
            inactivity_timeout: None,
            keepalive_interval: self.config.keepalive_interval(),
            keepalive_max: self.config.keepalive_max,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            self.config.host.clone(),
            self.config.port,
            self.config.strict_host_key_checking,
            self.known_hosts.clone(),
        );

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect(Arc::new(ssh_config), socket_addr, handler),
        )
        .await
        .map_err(|_| {
            TransportError::Timeout(format!(
                "Connection to {} timed out after {}s",
                addr,
                timeout.as_secs()
            ))
        })??;

        debug!("SSH handshake completed with {}", addr);

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        let result = tokio::time::timeout(
            timeout,
            handle.authenticate_publickey(&self.config.username, key_with_hash),
        )
        .await
        .map_err(|_| TransportError::Timeout("Authentication timed out".to_string()))?
        .map_err(|e| TransportError::AuthFailed(e.to_string()))?;

        if !result.success() {
            return Err(TransportError::AuthFailed(format!(
                "Public key rejected for user {}",
                self.config.username
            )));
        }

        info!("SSH authentication successful for {}@{}", self.config.username, addr);
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Verifies the server key against known_hosts.
pub struct ClientHandler {
    host: String,
    port: u16,
    /// - true: reject unknown keys
    /// - false: record unknown keys, still reject changed ones
    strict: bool,
    known_hosts: Arc<KnownHostsStore>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool, known_hosts: Arc<KnownHostsStore>) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        match self.known_hosts.verify(&self.host, self.port, server_public_key) {
            HostKeyVerification::Verified => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            HostKeyVerification::Unknown { fingerprint } => {
                if self.strict {
                    warn!(
                        "Unknown host key for {}:{} (fingerprint: {}). Strict mode enabled, rejecting.",
                        self.host, self.port, fingerprint
                    );
                    return Err(TransportError::HostKeyRejected(format!(
                        "unknown host {}:{} ({})",
                        self.host, self.port, fingerprint
                    )));
                }

                info!(
                    "New host {}:{}, adding to known_hosts (fingerprint: {})",
                    self.host, self.port, fingerprint
                );
                if let Err(e) = self.known_hosts.add_host(&self.host, self.port, server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            HostKeyVerification::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                warn!(
                    "HOST KEY CHANGED for {}:{}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                );
                Err(TransportError::HostKeyRejected(format!(
                    "key for {}:{} changed (expected {}, got {})",
                    self.host, self.port, expected_fingerprint, actual_fingerprint
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{loopback_transport, unused_local_port};

    #[tokio::test]
    async fn test_unreadable_key_fails_before_dialing() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("id_ed25519");
        std::fs::write(&key_path, "not a key").unwrap();

        // Nothing listens there; a network attempt would fail differently
        let addr = unused_local_port().await;
        let known_hosts = Arc::new(KnownHostsStore::with_path(dir.path().join("known_hosts")));
        let err = SshClient::new(loopback_transport(addr, key_path), known_hosts)
            .connect()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::KeyRejected(_)), "{:?}", err);
    }
}
