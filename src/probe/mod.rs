//! Instance Health Prober
//!
//! Read-only check that the remote target is up before a tunnel is attempted.
//!
//! - Cloud instance identifiers are looked up with EC2 `DescribeInstances`;
//!   the reported public address becomes the SSH address.
//! - Plain host addresses get a bounded TCP reachability check on the SSH port.
//!
//! Every probe is bounded by the configured timeout.

mod credentials;
mod ec2;
mod reachability;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::{ConnectionProfile, Target};

pub use credentials::CloudCredentials;
pub use ec2::Ec2Prober;
pub use reachability::ReachabilityProber;

/// Reported instance state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    Stopped,
    /// Pending, unrecognized, or not determinable (e.g. no credentials)
    Unknown,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Probe errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe target unreachable: {0}")]
    Unreachable(String),

    #[error("Probe not authorized: {0}")]
    Unauthorized(String),

    #[error("Probe timed out after {0}s")]
    Timeout(u64),
}

impl Serialize for ProbeError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// What a probe learned about the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub state: InstanceState,
    /// Address to dial over SSH, when the probe learned one
    pub public_address: Option<String>,
}

impl InstanceDescription {
    pub fn new(state: InstanceState, public_address: Option<String>) -> Self {
        Self {
            state,
            public_address,
        }
    }

    pub fn unknown() -> Self {
        Self::new(InstanceState::Unknown, None)
    }
}

#[async_trait]
pub trait InstanceProber: Send + Sync {
    /// One bounded query about the profile's target
    async fn describe(&self, profile: &ConnectionProfile)
        -> Result<InstanceDescription, ProbeError>;

    async fn probe(&self, profile: &ConnectionProfile) -> Result<InstanceState, ProbeError> {
        Ok(self.describe(profile).await?.state)
    }
}

/// Dispatches on the profile's target kind
pub struct DefaultProber {
    cloud: Ec2Prober,
    reachability: ReachabilityProber,
    timeout: Duration,
}

impl DefaultProber {
    pub fn new(cloud: Ec2Prober, timeout: Duration) -> Self {
        Self {
            cloud,
            reachability: ReachabilityProber::new(timeout),
            timeout,
        }
    }

    /// Cloud credentials from the environment
    pub fn from_env(timeout: Duration) -> Self {
        Self::new(Ec2Prober::new(CloudCredentials::from_env()), timeout)
    }
}

#[async_trait]
impl InstanceProber for DefaultProber {
    async fn describe(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<InstanceDescription, ProbeError> {
        let query = async {
            match profile.target() {
                Target::Instance(id) => {
                    debug!("Probing cloud instance {}", id);
                    self.cloud.describe(profile).await
                }
                Target::Address(host) => {
                    debug!("Probing reachability of {}:{}", host, profile.ssh_port);
                    self.reachability.describe(profile).await
                }
            }
        };

        tokio::time::timeout(self.timeout, query)
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout.as_secs()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_address_target_uses_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = DefaultProber::new(Ec2Prober::new(None), Duration::from_secs(2));
        let profile = ConnectionProfile::new("127.0.0.1", "ubuntu", "/tmp/key").with_ssh_port(port);

        let desc = prober.describe(&profile).await.unwrap();
        assert_eq!(desc.state, InstanceState::Running);
        assert_eq!(desc.public_address.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn test_instance_without_credentials_is_unknown() {
        let prober = DefaultProber::new(Ec2Prober::new(None), Duration::from_secs(2));
        let profile = ConnectionProfile::new("i-0123456789abcdef0", "ec2-user", "/tmp/key")
            .with_region("us-east-1");

        assert_eq!(prober.probe(&profile).await.unwrap(), InstanceState::Unknown);
    }

    #[tokio::test]
    async fn test_probe_is_bounded() {
        // Accepts the connection but never answers the HTTP request
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let creds = CloudCredentials::new("AKIDEXAMPLE", "secret");
        let cloud = Ec2Prober::new(Some(creds)).with_endpoint(format!("http://{}", addr));
        let prober = DefaultProber::new(cloud, Duration::from_millis(200));
        let profile = ConnectionProfile::new("i-0123456789abcdef0", "ec2-user", "/tmp/key")
            .with_region("us-east-1");

        let started = std::time::Instant::now();
        let err = prober.describe(&profile).await.unwrap_err();
        assert!(matches!(err, ProbeError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(InstanceState::Running.to_string(), "running");
        assert_eq!(
            serde_json::to_string(&InstanceState::Stopped).unwrap(),
            "\"stopped\""
        );
    }
}
