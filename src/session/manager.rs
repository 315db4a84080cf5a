//! Session Manager
//!
//! Orchestrates one tunnel session: health probe, transport connect with
//! backoff, SOCKS5 front, and liveness supervision with optional automatic
//! reconnection.
//!
//! # Ownership
//!
//! The manager owns the transport and the listener. Relay tasks only ever see
//! a `ChannelView`, so teardown happens here and nowhere else.
//!
//! # Locking
//!
//! - `status`: parking_lot lock, held for field updates only, so `status()`
//!   never waits on a connect in progress
//! - `slot`: tokio mutex, held across a whole connect, reconnect or teardown
//! - `supervisor`: parking_lot lock around the supervisor's cancel token

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{SessionError, SessionState, SessionStatus};
use crate::config::{ConnectionProfile, SessionSettings, Target};
use crate::forwarding::{start_dynamic_forward, DynamicForwardHandle, ForwardStats};
use crate::probe::{DefaultProber, InstanceProber, InstanceState, ProbeError};
use crate::ssh::{
    ChannelView, KnownHostsStore, PingResult, SshConnector, TransportConfig, TransportError,
    Tunnel, TunnelConnector,
};

/// Mutable status fields
struct StatusCell {
    state: SessionState,
    last_error: Option<SessionError>,
    proxying_since: Option<Instant>,
    retry_count: u32,
    proxy_address: Option<SocketAddr>,
    stats: Option<Arc<parking_lot::RwLock<ForwardStats>>>,
}

impl StatusCell {
    fn snapshot(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            uptime: match (self.state, self.proxying_since) {
                (SessionState::Proxying, Some(since)) => Some(since.elapsed()),
                _ => None,
            },
            retry_count: self.retry_count,
            proxy_address: self.proxy_address,
            stats: self
                .stats
                .as_ref()
                .map(|s| s.read().clone())
                .unwrap_or_default(),
        }
    }
}

/// Resources held for the current target
struct ActiveSession {
    profile: ConnectionProfile,
    /// SSH address the target resolved to
    address: String,
    tunnel: Option<Arc<dyn Tunnel>>,
    listener: Option<DynamicForwardHandle>,
}

struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct SessionInner {
    settings: SessionSettings,
    prober: Arc<dyn InstanceProber>,
    connector: Arc<dyn TunnelConnector>,
    status: RwLock<StatusCell>,
    status_tx: watch::Sender<SessionStatus>,
    slot: Mutex<Option<ActiveSession>>,
    supervisor: parking_lot::Mutex<Option<Supervisor>>,
}

/// Why supervision stopped
enum Watch {
    Cancelled,
    Lost(&'static str),
}

/// Owned handle to the single session of this process
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        settings: SessionSettings,
        prober: Arc<dyn InstanceProber>,
        connector: Arc<dyn TunnelConnector>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::idle());
        Self {
            inner: Arc::new(SessionInner {
                settings,
                prober,
                connector,
                status: RwLock::new(StatusCell {
                    state: SessionState::Idle,
                    last_error: None,
                    proxying_since: None,
                    retry_count: 0,
                    proxy_address: None,
                    stats: None,
                }),
                status_tx,
                slot: Mutex::new(None),
                supervisor: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Real SSH transport, cloud credentials from the environment
    pub fn with_defaults(settings: SessionSettings) -> Self {
        let prober = Arc::new(DefaultProber::from_env(settings.probe_timeout()));
        let connector = Arc::new(SshConnector::new(
            Arc::new(KnownHostsStore::new()),
            settings.ping_timeout(),
        ));
        Self::new(settings, prober, connector)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    /// Bring the session up: validate, probe, connect, start the proxy
    pub async fn connect(&self, profile: ConnectionProfile) -> Result<(), SessionError> {
        if self.inner.status.read().state.is_active() {
            return Err(SessionError::AlreadyActive);
        }
        // Held for the whole connect; a concurrent caller bounces off
        let Ok(mut slot) = self.inner.slot.try_lock() else {
            return Err(SessionError::AlreadyActive);
        };
        if self.inner.status.read().state.is_active() {
            return Err(SessionError::AlreadyActive);
        }

        self.inner.stop_supervisor().await;

        if let Err(e) = profile.validate() {
            warn!("Profile rejected: {}", e);
            let err = SessionError::from(e);
            self.inner.fail(SessionState::Idle, err.clone());
            return Err(err);
        }

        // A tunnel kept after a bind failure is reused for the same target
        let reusable = slot.as_ref().and_then(|active| {
            let tunnel = active.tunnel.as_ref()?;
            (active.profile.same_tunnel(&profile) && tunnel.is_connected())
                .then(|| (tunnel.clone(), active.address.clone()))
        });

        let (tunnel, address) = match reusable {
            Some((tunnel, address)) => {
                info!("Reusing open tunnel {} for {}", tunnel.id(), profile.host);
                if let Some(active) = slot.as_mut() {
                    if let Some(listener) = active.listener.take() {
                        listener.stop(self.inner.settings.drain_grace()).await;
                    }
                }
                (tunnel, address)
            }
            None => {
                if let Some(previous) = slot.take() {
                    self.inner.teardown(previous).await;
                }
                match self.inner.establish_transport(&profile).await {
                    Ok(pair) => pair,
                    Err(err) => {
                        self.inner.fail(SessionState::Failed, err.clone());
                        return Err(err);
                    }
                }
            }
        };

        let listener = match self.inner.start_listener(&profile, &tunnel).await {
            Ok(listener) => listener,
            Err(err) => {
                // Transport stays up for a retry on another port
                *slot = Some(ActiveSession {
                    profile,
                    address,
                    tunnel: Some(tunnel),
                    listener: None,
                });
                self.inner.fail(SessionState::Failed, err.clone());
                return Err(err);
            }
        };

        self.inner.mark_proxying(&listener);
        *slot = Some(ActiveSession {
            profile,
            address,
            tunnel: Some(tunnel.clone()),
            listener: Some(listener),
        });

        self.inner.spawn_supervisor(tunnel);
        Ok(())
    }

    /// Tear the session down; safe to call in any state, any number of times
    pub async fn disconnect(&self) {
        // Stop a reconnect in progress before waiting for the slot
        if let Some(supervisor) = self.inner.supervisor.lock().as_ref() {
            supervisor.cancel.cancel();
        }

        let mut slot = self.inner.slot.lock().await;
        self.inner.stop_supervisor().await;

        if let Some(active) = slot.take() {
            info!("Disconnecting session for {}", active.profile.host);
            self.inner.teardown(active).await;
        }

        self.inner.update(|cell| {
            cell.state = SessionState::Idle;
            cell.proxying_since = None;
            cell.proxy_address = None;
            cell.retry_count = 0;
        });
    }

    /// Snapshot of the current state
    pub fn status(&self) -> SessionStatus {
        self.inner.status.read().snapshot()
    }

    /// Status transitions as they happen
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        // Supervisor holds the inner state; let it go so resources drop
        if let Some(supervisor) = self.inner.supervisor.lock().take() {
            supervisor.cancel.cancel();
        }
    }
}

impl SessionInner {
    fn update(&self, f: impl FnOnce(&mut StatusCell)) {
        let snapshot = {
            let mut cell = self.status.write();
            f(&mut cell);
            cell.snapshot()
        };
        debug!("Session state: {}", snapshot.state);
        self.status_tx.send_replace(snapshot);
    }

    fn set_state(&self, state: SessionState) {
        self.update(|cell| cell.state = state);
    }

    fn fail(&self, state: SessionState, err: SessionError) {
        error!("Session error: {}", err);
        self.update(|cell| {
            cell.state = state;
            cell.last_error = Some(err);
            cell.proxying_since = None;
            cell.proxy_address = None;
        });
    }

    fn mark_proxying(&self, listener: &DynamicForwardHandle) {
        info!("Proxying on {}", listener.bound_addr);
        self.update(|cell| {
            cell.state = SessionState::Proxying;
            cell.last_error = None;
            cell.proxying_since = Some(Instant::now());
            cell.proxy_address = Some(listener.bound_addr);
            cell.stats = Some(listener.stats_source());
        });
    }

    /// Probe, then connect the transport
    async fn establish_transport(
        &self,
        profile: &ConnectionProfile,
    ) -> Result<(Arc<dyn Tunnel>, String), SessionError> {
        self.update(|cell| {
            cell.state = SessionState::Probing;
            cell.retry_count = 0;
        });

        let timeout = self.settings.probe_timeout();
        let description = tokio::time::timeout(timeout, self.prober.describe(profile))
            .await
            .map_err(|_| ProbeError::Timeout(timeout.as_secs()))??;

        match description.state {
            InstanceState::Running => {}
            InstanceState::Unknown if self.settings.proceed_on_unknown => {
                warn!("Instance state unknown for {}, connecting anyway", profile.host);
            }
            state => return Err(SessionError::InstanceNotRunning(state)),
        }

        let address = match (description.public_address, profile.target()) {
            (Some(address), _) => address,
            (None, Target::Address(host)) => host.to_string(),
            (None, Target::Instance(id)) => {
                return Err(ProbeError::Unreachable(format!("{} has no public address", id)).into())
            }
        };

        self.set_state(SessionState::Connecting);
        let config = TransportConfig::from_profile(profile, &address, &self.settings);
        let tunnel = self.connect_with_retry(config).await?;
        Ok((tunnel, address))
    }

    /// Transient failures are retried with backoff; fatal ones end it
    async fn connect_with_retry(
        &self,
        config: TransportConfig,
    ) -> Result<Arc<dyn Tunnel>, TransportError> {
        let policy = &self.settings.retry;
        let max_attempts = policy.attempts();
        let timeout = self.settings.connect_timeout();
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.update(|cell| cell.retry_count = attempt);
            info!(
                "Transport attempt {}/{} to {}",
                attempt,
                max_attempts,
                config.addr()
            );

            let result = tokio::time::timeout(timeout, self.connector.connect(config.clone()))
                .await
                .unwrap_or_else(|_| {
                    Err(TransportError::Timeout(format!(
                        "connect to {} exceeded {}s",
                        config.addr(),
                        timeout.as_secs()
                    )))
                });

            match result {
                Ok(tunnel) => {
                    info!("Tunnel {} established", tunnel.id());
                    return Ok(tunnel);
                }
                Err(e) if !e.is_transient() => {
                    error!("Transport failed permanently: {}", e);
                    return Err(e);
                }
                Err(e) if attempt >= max_attempts => {
                    error!("Transport failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        "Transport attempt {} failed: {}; retrying in {}ms",
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn start_listener(
        &self,
        profile: &ConnectionProfile,
        tunnel: &Arc<dyn Tunnel>,
    ) -> Result<DynamicForwardHandle, SessionError> {
        let view = Arc::new(ChannelView::new(tunnel.clone()));
        Ok(start_dynamic_forward(&profile.bind_addr(), view).await?)
    }

    async fn teardown(&self, mut active: ActiveSession) {
        if let Some(listener) = active.listener.take() {
            listener.stop(self.settings.drain_grace()).await;
        }
        if let Some(tunnel) = active.tunnel.take() {
            tunnel.close().await;
        }
    }

    async fn stop_supervisor(&self) {
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            let _ = supervisor.task.await;
        }
    }

    fn spawn_supervisor(self: &Arc<Self>, tunnel: Arc<dyn Tunnel>) {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervise(self.clone(), tunnel, cancel.clone()));
        *self.supervisor.lock() = Some(Supervisor { cancel, task });
    }
}

/// Watch the transport; on loss tear down and optionally reconnect
async fn supervise(inner: Arc<SessionInner>, mut tunnel: Arc<dyn Tunnel>, cancel: CancellationToken) {
    loop {
        let reason = match watch_tunnel(&inner.settings, tunnel.as_ref(), &cancel).await {
            Watch::Cancelled => return,
            Watch::Lost(reason) => reason,
        };

        warn!("Tunnel {} lost: {}", tunnel.id(), reason);

        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return,
            guard = inner.slot.lock() => guard,
        };

        inner.fail(
            SessionState::Failed,
            SessionError::TransportFailed(TransportError::Disconnected),
        );

        let Some(active) = slot.as_mut() else {
            return;
        };
        if let Some(listener) = active.listener.take() {
            listener.stop(inner.settings.drain_grace()).await;
        }
        if let Some(dead) = active.tunnel.take() {
            dead.close().await;
        }

        if !inner.settings.auto_reconnect {
            info!("Auto-reconnect disabled; session stays failed");
            return;
        }

        inner.set_state(SessionState::Reconnecting);
        let config = TransportConfig::from_profile(&active.profile, &active.address, &inner.settings);

        let reconnected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = inner.connect_with_retry(config) => result,
        };

        let fresh = match reconnected {
            Ok(fresh) => fresh,
            Err(e) => {
                inner.fail(SessionState::Failed, SessionError::TransportFailed(e));
                return;
            }
        };

        match inner.start_listener(&active.profile, &fresh).await {
            Ok(listener) => {
                inner.mark_proxying(&listener);
                active.listener = Some(listener);
                active.tunnel = Some(fresh.clone());
                info!("Session restored over tunnel {}", fresh.id());
                tunnel = fresh;
            }
            Err(err) => {
                active.tunnel = Some(fresh);
                inner.fail(SessionState::Failed, err);
                return;
            }
        }
    }
}

/// Heartbeat plus disconnect notification
async fn watch_tunnel(
    settings: &SessionSettings,
    tunnel: &dyn Tunnel,
    cancel: &CancellationToken,
) -> Watch {
    let mut disconnect_rx = tunnel.subscribe_disconnect();
    if !tunnel.is_connected() {
        return Watch::Lost("transport already closed");
    }

    let mut ticker = tokio::time::interval(settings.heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    ticker.tick().await;

    let threshold = settings.dead_peer_threshold.max(1);
    let mut misses = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Watch::Cancelled,
            _ = disconnect_rx.recv() => return Watch::Lost("disconnect notification"),
            _ = ticker.tick() => {
                let ping = tokio::select! {
                    _ = cancel.cancelled() => return Watch::Cancelled,
                    r = tokio::time::timeout(settings.ping_timeout(), tunnel.ping()) => {
                        r.unwrap_or(PingResult::Timeout)
                    }
                };
                match ping {
                    PingResult::Ok => misses = 0,
                    PingResult::IoError => return Watch::Lost("heartbeat I/O error"),
                    PingResult::Timeout => {
                        misses += 1;
                        warn!(
                            "Heartbeat timeout for tunnel {} ({}/{})",
                            tunnel.id(),
                            misses,
                            threshold
                        );
                        if misses >= threshold {
                            return Watch::Lost("peer unresponsive");
                        }
                    }
                }
            }
        }
    }
}
