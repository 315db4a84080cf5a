//! tunnelproxy - connect to a remote instance and serve a local SOCKS5 proxy

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tunnelproxy_lib::config::{ConfigStorage, ConnectionProfile};
use tunnelproxy_lib::system_proxy::{NoopSystemProxy, SystemProxy, SystemProxySettings};
use tunnelproxy_lib::ssh::TransportError;
use tunnelproxy_lib::{init_logging, SessionError, SessionManager, SessionState, SessionStatus};

/// SSH tunnel with a local SOCKS5 proxy
#[derive(Parser, Debug)]
#[command(name = "tunnelproxy")]
#[command(about = "Tunnel to a remote instance over SSH and expose it as a local SOCKS5 proxy")]
#[command(version)]
struct Args {
    /// Config file (default: ~/.tunnelproxy/profile.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host address or instance identifier (overrides the saved profile)
    #[arg(long)]
    host: Option<String>,

    /// SSH username
    #[arg(short, long)]
    user: Option<String>,

    /// Private key file
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Region or zone of the instance
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// SSH port
    #[arg(long)]
    ssh_port: Option<u16>,

    /// Local SOCKS5 port
    #[arg(short, long)]
    port: Option<u16>,

    /// Local bind address
    #[arg(long)]
    bind: Option<String>,

    /// Stay failed instead of reconnecting when the tunnel drops
    #[arg(long)]
    no_reconnect: bool,

    /// Connect even when the instance state cannot be determined
    #[arg(long)]
    allow_unknown: bool,

    /// Save the resulting profile to the config file
    #[arg(long)]
    save: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let storage = match &args.config {
        Some(path) => ConfigStorage::with_path(path.clone()),
        None => ConfigStorage::new().context("Cannot locate config directory")?,
    };
    let mut file = storage
        .load()
        .await
        .with_context(|| format!("Failed to load {}", storage.path().display()))?;

    let profile = resolve_profile(&args, file.profile.take())?;
    let mut settings = file.settings.clone();
    if args.no_reconnect {
        settings.auto_reconnect = false;
    }
    if args.allow_unknown {
        settings.proceed_on_unknown = true;
    }

    if args.save {
        file.profile = Some(profile.clone());
        storage
            .save(&file)
            .await
            .with_context(|| format!("Failed to save {}", storage.path().display()))?;
        info!("Profile saved to {}", storage.path().display());
    }

    let auto_reconnect = settings.auto_reconnect;
    let manager = SessionManager::with_defaults(settings);
    let system_proxy = NoopSystemProxy::new();
    let mut updates = manager.subscribe();

    println!("Connecting to {}...", profile.host);
    manager
        .connect(profile)
        .await
        .context("Failed to start tunnel")?;

    let status = manager.status();
    print_status(&status);
    if let Some(addr) = status.proxy_address {
        system_proxy.apply(&SystemProxySettings::new(addr)).await?;
    }
    let mut previous = updates.borrow_and_update().state;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, shutting down");
                break Ok(());
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let status = updates.borrow_and_update().clone();
                print_status(&status);
                if ends_session(previous, &status, auto_reconnect) {
                    break Err(status);
                }
                previous = status.state;
            }
        }
    };

    if let Err(e) = system_proxy.revert().await {
        warn!("{}", e);
    }
    manager.disconnect().await;
    println!("Disconnected");

    if let Err(status) = outcome {
        match status.last_error {
            Some(err) => bail!("Tunnel lost: {}", err),
            None => bail!("Tunnel lost"),
        }
    }
    Ok(())
}

/// Flags override the saved profile; `--host` starts a fresh one
fn resolve_profile(args: &Args, saved: Option<ConnectionProfile>) -> Result<ConnectionProfile> {
    let mut profile = match (&args.host, saved) {
        (Some(host), saved) => {
            let user = args
                .user
                .clone()
                .or_else(|| saved.as_ref().map(|p| p.username.clone()))
                .context("--user is required with --host")?;
            let key = args
                .key
                .clone()
                .or_else(|| saved.as_ref().map(|p| p.key_path.clone()))
                .context("--key is required with --host")?;
            ConnectionProfile::new(host.clone(), user, key)
        }
        (None, Some(saved)) => saved,
        (None, None) => bail!("No saved profile; pass --host, --user and --key"),
    };

    if let Some(user) = &args.user {
        profile.username = user.clone();
    }
    if let Some(key) = &args.key {
        profile.key_path = key.clone();
    }
    if let Some(region) = &args.region {
        profile.region = Some(region.clone());
    }
    if let Some(port) = args.ssh_port {
        profile.ssh_port = port;
    }
    if let Some(port) = args.port {
        profile.bind_port = port;
    }
    if let Some(bind) = &args.bind {
        profile.bind_address = bind.clone();
    }
    Ok(profile)
}

/// Whether a `Failed` status is final
///
/// With auto-reconnect on, the transport loss itself is reported as
/// `Failed(TransportFailed(Disconnected))` before the supervisor moves to
/// `Reconnecting`; only a failure after that, or any other error, is final.
fn ends_session(previous: SessionState, status: &SessionStatus, auto_reconnect: bool) -> bool {
    if status.state != SessionState::Failed {
        return false;
    }
    if !auto_reconnect || previous == SessionState::Reconnecting {
        return true;
    }
    !matches!(
        status.last_error,
        Some(SessionError::TransportFailed(TransportError::Disconnected))
    )
}

fn print_status(status: &SessionStatus) {
    match (status.state, status.proxy_address) {
        (SessionState::Proxying, Some(addr)) => println!("Proxying: socks5://{}", addr),
        (SessionState::Connecting, _) | (SessionState::Reconnecting, _) => {
            println!("{} (attempt {})", status.state, status.retry_count)
        }
        (SessionState::Failed, _) => match &status.last_error {
            Some(err) => println!("Failed: {}", err),
            None => println!("Failed"),
        },
        (state, _) => println!("{}", state),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(err: SessionError) -> SessionStatus {
        SessionStatus {
            state: SessionState::Failed,
            last_error: Some(err),
            ..SessionStatus::idle()
        }
    }

    #[test]
    fn test_exits_when_reconnect_gives_up() {
        let lost = failed(SessionError::TransportFailed(TransportError::Disconnected));
        let exhausted = failed(SessionError::TransportFailed(TransportError::Timeout(
            "connect".into(),
        )));

        // Loss while proxying: the supervisor is about to reconnect
        assert!(!ends_session(SessionState::Proxying, &lost, true));
        // Retries exhausted
        assert!(ends_session(SessionState::Reconnecting, &exhausted, true));
        assert!(ends_session(SessionState::Reconnecting, &lost, true));
        // Reconnecting update coalesced away
        assert!(ends_session(SessionState::Proxying, &exhausted, true));
        assert!(ends_session(
            SessionState::Reconnecting,
            &failed(SessionError::PortInUse("127.0.0.1:8080".into())),
            true
        ));
    }

    #[test]
    fn test_exits_on_loss_without_reconnect() {
        let lost = failed(SessionError::TransportFailed(TransportError::Disconnected));
        assert!(ends_session(SessionState::Proxying, &lost, false));

        let mut reconnecting = SessionStatus::idle();
        reconnecting.state = SessionState::Reconnecting;
        assert!(!ends_session(SessionState::Proxying, &reconnecting, true));
    }
}
