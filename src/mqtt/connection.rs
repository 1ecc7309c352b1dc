//! Broker connection manager
//!
//! Owns the lifecycle of exactly one broker session and publishes its state through a
//! `watch` channel:
//!
//! ```text
//! Disconnected ──connect──► Connecting ──ok──► Connected ◄──ok── Reconnecting
//!      ▲                        │                 │                  │
//!      │                      error         transport drop ─────────►│
//!      │                        ▼                                    │
//!      │                   Failed(reason) ◄──── backoff exhausted ───┘
//!      └───────────── disconnect (from Connected / Reconnecting / Failed)
//! ```
//!
//! # Tasks
//!
//! `connect` performs the handshake itself, then hands the session driver to a
//! supervisor task. The supervisor keeps the event loop moving, notices transport
//! drops and reconnects with exponential backoff. While a session is live it is the
//! only writer of the connection state; every write it makes is checked against the
//! session slot, so once `disconnect` has taken the session the supervisor can no
//! longer change anything.
//!
//! `connect` and `disconnect` are serialized by a lifecycle lock that the supervisor
//! never takes.

use super::backoff::{Backoff, BackoffSettings};
use super::transport::{
    BrokerTransport, DriverEvent, QoS, SessionClient, SessionDriver, SessionOptions,
};
use crate::config::BrokerConfig;
use crate::sensor::Sample;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Observable state of the broker connection
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// A session exists only in these states
    pub fn has_session(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connected | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("Disconnected"),
            ConnectionState::Connecting => f.write_str("Connecting"),
            ConnectionState::Connected => f.write_str("Connected"),
            ConnectionState::Reconnecting => f.write_str("Reconnecting"),
            ConnectionState::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// A configuration field is missing or malformed; nothing was sent
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The broker could not be reached or refused the handshake
    #[error("Failed to connect: {0}")]
    ConnectFailure(String),

    #[error("Not connected to broker")]
    NotConnected,

    #[error("A broker session is already live")]
    AlreadyConnected,

    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Tunables for sessions opened by the [`ConnectionManager`]
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ConnectionSettings {
    pub qos: QoS,
    pub keep_alive_secs: u64,
    /// Upper bound for the connect handshake
    pub connect_timeout_ms: u64,
    /// How long `disconnect` waits for the supervisor before aborting it
    pub disconnect_grace_ms: u64,
    pub request_capacity: usize,
    pub reconnect: BackoffSettings,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            keep_alive_secs: 30,
            connect_timeout_ms: 10_000,
            disconnect_grace_ms: 2_000,
            request_capacity: 100,
            reconnect: BackoffSettings::default(),
        }
    }
}

/// Counters exposed for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionMetrics {
    pub sessions_opened: u64,
    pub messages_published: u64,
    pub transport_drops: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicU64,
    messages_published: AtomicU64,
    transport_drops: AtomicU64,
    reconnect_attempts: AtomicU64,
}

struct LiveSession {
    id: u64,
    client: Arc<dyn SessionClient>,
    closing: CancellationToken,
    supervisor: JoinHandle<()>,
}

impl LiveSession {
    /// Requests a clean disconnect and waits a bounded time for the supervisor
    async fn shutdown(self, grace: Duration) {
        let LiveSession {
            id,
            client,
            closing,
            mut supervisor,
        } = self;

        closing.cancel();
        match timeout(grace, client.disconnect()).await {
            Ok(Ok(())) => debug!("Disconnect requested for session {}", id),
            Ok(Err(e)) => debug!("Disconnect request for session {} failed: {}", id, e),
            Err(_) => warn!("Disconnect request for session {} timed out", id),
        }

        match timeout(grace, &mut supervisor).await {
            Ok(_) => debug!("Supervisor of session {} finished", id),
            Err(_) => {
                warn!(
                    "Supervisor of session {} still running after {:?}, aborting",
                    id, grace
                );
                supervisor.abort();
            }
        }
    }
}

struct Shared {
    transport: Arc<dyn BrokerTransport>,
    settings: ConnectionSettings,
    state_tx: watch::Sender<ConnectionState>,
    session: Mutex<Option<LiveSession>>,
    lifecycle: tokio::sync::Mutex<()>,
    next_session_id: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn session_slot(&self) -> MutexGuard<'_, Option<LiveSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            info!("Connection state: {} -> {}", previous, next);
        }
    }

    /// State write on behalf of a supervisor; ignored once its session is gone
    fn set_state_for(&self, session_id: u64, next: ConnectionState) -> bool {
        let slot = self.session_slot();
        if slot.as_ref().map(|s| s.id) != Some(session_id) {
            return false;
        }
        self.set_state(next);
        true
    }

    /// Releases a session whose reconnect budget ran out
    fn fail_session(&self, session_id: u64, reason: String) {
        let mut slot = self.session_slot();
        if slot.as_ref().map(|s| s.id) != Some(session_id) {
            return;
        }
        let released = slot.take();
        self.set_state(ConnectionState::Failed(reason));
        drop(slot);
        drop(released);
    }

    fn fail_connect(&self, reason: String) -> ConnectionError {
        error!("Failed to establish broker connection: {}", reason);
        self.set_state(ConnectionState::Failed(reason.clone()));
        ConnectionError::ConnectFailure(reason)
    }
}

/// Cloneable handle to the single broker session of a bridge
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BrokerTransport>, settings: ConnectionSettings) -> Self {
        info!(
            "Creating connection manager on {} transport with settings: {:?}",
            transport.name(),
            settings
        );
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                settings,
                state_tx,
                session: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
                next_session_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.shared.settings
    }

    pub fn has_session(&self) -> bool {
        self.shared.session_slot().is_some()
    }

    pub fn metrics(&self) -> ConnectionMetrics {
        let counters = &self.shared.counters;
        ConnectionMetrics {
            sessions_opened: counters.sessions_opened.load(Ordering::Relaxed),
            messages_published: counters.messages_published.load(Ordering::Relaxed),
            transport_drops: counters.transport_drops.load(Ordering::Relaxed),
            reconnect_attempts: counters.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    /// Opens a persistent session and waits for the broker to accept it
    ///
    /// The configuration is validated before any I/O; an invalid configuration
    /// leaves the state untouched. A failed handshake leaves the manager in
    /// `Failed` until `connect` is called again.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<(), ConnectionError> {
        let address = config.validate().map_err(|e| {
            warn!("Rejecting broker configuration: {}", e);
            ConnectionError::InvalidConfiguration(e.to_string())
        })?;

        let _lifecycle = self.shared.lifecycle.lock().await;

        let stale = {
            let mut slot = self.shared.session_slot();
            if slot.is_some() && self.state().has_session() {
                return Err(ConnectionError::AlreadyConnected);
            }
            slot.take()
        };
        if let Some(stale) = stale {
            debug!("Releasing stale session {} before reconnecting", stale.id);
            stale.shutdown(self.grace()).await;
        }

        info!("Connecting to {} as '{}'", address, config.client_id);
        self.shared.set_state(ConnectionState::Connecting);

        let settings = &self.shared.settings;
        let options = SessionOptions {
            address,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            keep_alive: Duration::from_secs(settings.keep_alive_secs),
            clean_session: false,
            request_capacity: settings.request_capacity,
        };
        debug!("Opening session with {:?}", options);

        let (client, mut driver) = self
            .shared
            .transport
            .open(&options)
            .map_err(|e| self.shared.fail_connect(e.to_string()))?;
        self.shared
            .counters
            .sessions_opened
            .fetch_add(1, Ordering::Relaxed);

        let connect_timeout = Duration::from_millis(settings.connect_timeout_ms);
        match timeout(connect_timeout, await_handshake(driver.as_mut())).await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(self.shared.fail_connect(reason)),
            Err(_) => {
                return Err(self.shared.fail_connect(format!(
                    "no CONNACK within {}ms",
                    settings.connect_timeout_ms
                )))
            }
        }

        let id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed);
        let closing = CancellationToken::new();

        // Hold the slot while spawning so the supervisor cannot act on a session
        // that is not stored yet
        let mut slot = self.shared.session_slot();
        self.shared.set_state(ConnectionState::Connected);
        let supervisor = tokio::spawn(supervise(
            self.shared.clone(),
            id,
            driver,
            closing.clone(),
        ));
        *slot = Some(LiveSession {
            id,
            client,
            closing,
            supervisor,
        });
        drop(slot);

        info!("Broker session {} established", id);
        Ok(())
    }

    /// Publishes one sample; only valid while `Connected`
    pub async fn publish(&self, topic: &str, sample: &Sample) -> Result<(), ConnectionError> {
        if !self.shared.state_tx.borrow().is_connected() {
            return Err(ConnectionError::NotConnected);
        }

        let client = match self.shared.session_slot().as_ref() {
            Some(session) => session.client.clone(),
            None => return Err(ConnectionError::NotConnected),
        };

        match client
            .publish(topic, self.shared.settings.qos, sample.payload())
            .await
        {
            Ok(()) => {
                self.shared
                    .counters
                    .messages_published
                    .fetch_add(1, Ordering::Relaxed);
                debug!("Published {} to '{}'", sample, topic);
                Ok(())
            }
            Err(e) if !self.state().is_connected() => {
                debug!("Publish raced with connection loss: {}", e);
                Err(ConnectionError::NotConnected)
            }
            Err(e) => Err(ConnectionError::PublishFailed(e.to_string())),
        }
    }

    /// Tears the session down; safe to call in any state
    pub async fn disconnect(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;

        let session = self.shared.session_slot().take();
        match session {
            Some(session) => {
                info!("Disconnecting broker session {}", session.id);
                session.shutdown(self.grace()).await;
            }
            None => debug!("Disconnect requested without a live session"),
        }
        self.shared.set_state(ConnectionState::Disconnected);
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.shared.settings.disconnect_grace_ms)
    }
}

async fn await_handshake(driver: &mut dyn SessionDriver) -> Result<(), String> {
    loop {
        match driver.poll().await {
            Ok(DriverEvent::Connected) => return Ok(()),
            Ok(DriverEvent::Activity) => continue,
            Ok(DriverEvent::Closed) => return Err("session closed during handshake".to_string()),
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Drives one session until it is closed, released or aborted
async fn supervise(
    shared: Arc<Shared>,
    session_id: u64,
    mut driver: Box<dyn SessionDriver>,
    closing: CancellationToken,
) {
    debug!("Supervisor for session {} started", session_id);
    let mut backoff = Backoff::new(&shared.settings.reconnect);

    loop {
        let polled = driver.poll().await;

        if closing.is_cancelled() {
            // Keep flushing until our disconnect went out
            if let Ok(DriverEvent::Activity) = polled {
                continue;
            }
            break;
        }

        match polled {
            Ok(DriverEvent::Connected) => {
                if backoff.attempts() > 0 {
                    info!(
                        "Session {} reconnected after {} attempt(s)",
                        session_id,
                        backoff.attempts()
                    );
                }
                backoff.reset();
                if !shared.set_state_for(session_id, ConnectionState::Connected) {
                    break;
                }
            }
            Ok(DriverEvent::Activity) => {}
            Ok(DriverEvent::Closed) | Err(_) => {
                let reason = match polled {
                    Err(e) => e.to_string(),
                    _ => "session closed by transport".to_string(),
                };

                if shared.state_tx.borrow().is_connected() {
                    warn!("Session {} lost its transport: {}", session_id, reason);
                    shared
                        .counters
                        .transport_drops
                        .fetch_add(1, Ordering::Relaxed);
                    if !shared.set_state_for(session_id, ConnectionState::Reconnecting) {
                        break;
                    }
                }

                let Some(delay) = backoff.next_delay() else {
                    let reason = format!(
                        "gave up reconnecting after {} attempt(s): {}",
                        backoff.attempts(),
                        reason
                    );
                    error!("Session {} {}", session_id, reason);
                    shared.fail_session(session_id, reason);
                    break;
                };

                shared
                    .counters
                    .reconnect_attempts
                    .fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Reconnect attempt {} for session {} in {:?} ({})",
                    backoff.attempts(),
                    session_id,
                    delay,
                    reason
                );

                tokio::select! {
                    _ = closing.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    debug!("Supervisor for session {} stopped", session_id);
}
