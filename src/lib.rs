//! TunnelProxy - SSH tunnel session manager
//!
//! Connects to one remote compute instance over SSH and exposes the tunnel
//! to local applications as a SOCKS5 proxy.
//!
//! ```text
//! caller ─▶ SessionManager ─▶ probe ─▶ ssh transport ─▶ SOCKS5 front ◀─ local apps
//! ```

pub mod config;
pub mod forwarding;
pub mod probe;
pub mod session;
pub mod ssh;
pub mod system_proxy;

#[cfg(test)]
mod test_support;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{ConnectionProfile, SessionSettings};
pub use session::{SessionError, SessionManager, SessionState, SessionStatus};

/// Initialize logging
///
/// `RUST_LOG` wins when set; otherwise `info`, or `debug` when verbose.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
