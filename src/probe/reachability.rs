//! TCP reachability probe for plain host addresses

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

use super::{InstanceDescription, InstanceState, ProbeError};
use crate::config::{ConnectionProfile, Target};

pub struct ReachabilityProber {
    timeout: Duration,
}

impl ReachabilityProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Connect to `host:ssh_port` and hang up
    pub async fn describe(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<InstanceDescription, ProbeError> {
        let host = match profile.target() {
            Target::Address(host) | Target::Instance(host) => host,
        };
        let port = profile.ssh_port;

        match tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => {
                debug!("{}:{} is reachable", host, port);
                Ok(InstanceDescription::new(
                    InstanceState::Running,
                    Some(host.to_string()),
                ))
            }
            Ok(Err(e)) => Err(ProbeError::Unreachable(format!("{}:{}: {}", host, port, e))),
            Err(_) => Err(ProbeError::Timeout(self.timeout.as_secs())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::unused_local_port;

    #[tokio::test]
    async fn test_refused_is_unreachable() {
        let closed = unused_local_port().await;
        let prober = ReachabilityProber::new(Duration::from_secs(2));
        let profile =
            ConnectionProfile::new("127.0.0.1", "ubuntu", "/tmp/key").with_ssh_port(closed.port());

        let err = prober.describe(&profile).await.unwrap_err();
        assert!(matches!(err, ProbeError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_bracketed_ipv6_host() {
        let Ok(listener) = tokio::net::TcpListener::bind("[::1]:0").await else {
            // No IPv6 loopback on this machine
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let profile = ConnectionProfile::new("[::1]", "ubuntu", "/tmp/key").with_ssh_port(port);

        let description = ReachabilityProber::new(Duration::from_secs(2))
            .describe(&profile)
            .await
            .unwrap();
        assert_eq!(description.state, InstanceState::Running);
        assert_eq!(description.public_address.as_deref(), Some("::1"));

        // The resolved address dials as a bracketed socket address
        let config = crate::ssh::TransportConfig::from_profile(
            &profile,
            "::1",
            &crate::config::SessionSettings::default(),
        );
        assert_eq!(config.addr(), format!("[::1]:{}", port));
    }
}
