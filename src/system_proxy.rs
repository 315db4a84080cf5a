//! System proxy capability
//!
//! Pointing the operating system's proxy settings at the local SOCKS5
//! endpoint is left to the embedding application. This module defines the
//! seam it plugs into.

use std::net::SocketAddr;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SystemProxyError {
    #[error("Failed to apply system proxy: {0}")]
    Apply(String),

    #[error("Failed to revert system proxy: {0}")]
    Revert(String),
}

/// What to point the system at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProxySettings {
    pub socks_address: SocketAddr,
    /// Hosts that bypass the proxy
    pub bypass: Vec<String>,
}

impl SystemProxySettings {
    pub fn new(socks_address: SocketAddr) -> Self {
        Self {
            socks_address,
            bypass: vec!["localhost".into(), "127.0.0.1".into(), "::1".into()],
        }
    }
}

#[async_trait]
pub trait SystemProxy: Send + Sync {
    async fn apply(&self, settings: &SystemProxySettings) -> Result<(), SystemProxyError>;

    /// Restore whatever was configured before `apply`
    async fn revert(&self) -> Result<(), SystemProxyError>;
}

/// Leaves the system untouched and only remembers the request
#[derive(Default)]
pub struct NoopSystemProxy {
    applied: Mutex<Option<SystemProxySettings>>,
}

impl NoopSystemProxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Option<SystemProxySettings> {
        self.applied.lock().clone()
    }
}

#[async_trait]
impl SystemProxy for NoopSystemProxy {
    async fn apply(&self, settings: &SystemProxySettings) -> Result<(), SystemProxyError> {
        info!(
            "System proxy not managed here; point clients at socks5://{}",
            settings.socks_address
        );
        *self.applied.lock() = Some(settings.clone());
        Ok(())
    }

    async fn revert(&self) -> Result<(), SystemProxyError> {
        self.applied.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_records_and_reverts() {
        let proxy = NoopSystemProxy::new();
        let settings = SystemProxySettings::new("127.0.0.1:8080".parse().unwrap());

        proxy.apply(&settings).await.unwrap();
        assert_eq!(proxy.applied(), Some(settings));

        proxy.revert().await.unwrap();
        assert_eq!(proxy.applied(), None);
        // Reverting twice is harmless
        proxy.revert().await.unwrap();
    }
}
