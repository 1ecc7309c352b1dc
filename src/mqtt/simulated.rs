//! In-process broker for dry runs and tests
//!
//! Behaves like a single MQTT broker reachable over a flaky link: it can be made
//! unreachable, can refuse handshakes, and can drop the current connection. Every
//! accepted publish is recorded as a [`PublishedMessage`].

use super::message::PublishedMessage;
use super::transport::{
    BoxFuture, BrokerTransport, DriverEvent, QoS, SessionClient, SessionDriver, SessionOptions,
    TransportError,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug)]
struct BrokerState {
    reachable: bool,
    refusal: Option<String>,
    connected: bool,
    drop_pending: bool,
    disconnect_requested: bool,
    sessions_opened: u64,
    live_sessions: u64,
    last_options: Option<SessionOptions>,
    messages: Vec<PublishedMessage>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            reachable: true,
            refusal: None,
            connected: false,
            drop_pending: false,
            disconnect_requested: false,
            sessions_opened: 0,
            live_sessions: 0,
            last_options: None,
            messages: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<BrokerState>,
    wakeup: Notify,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Simulated broker; clones share the same broker
#[derive(Debug, Clone, Default)]
pub struct SimulatedBroker {
    inner: Arc<Inner>,
}

impl SimulatedBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the broker (un)reachable; going unreachable drops a live connection
    pub fn set_reachable(&self, reachable: bool) {
        {
            let mut state = self.inner.state();
            state.reachable = reachable;
            if !reachable && state.connected {
                state.drop_pending = true;
            }
        }
        self.inner.wakeup.notify_one();
    }

    /// Refuses every following handshake with the given reason
    pub fn refuse_with(&self, reason: Option<String>) {
        self.inner.state().refusal = reason;
    }

    /// Drops the live connection once; the next handshake succeeds if reachable
    pub fn drop_connection(&self) {
        {
            let mut state = self.inner.state();
            if state.connected {
                state.drop_pending = true;
            }
        }
        self.inner.wakeup.notify_one();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().connected
    }

    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.inner.state().messages.clone()
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.state().sessions_opened
    }

    /// Sessions whose event loop still exists
    pub fn live_sessions(&self) -> u64 {
        self.inner.state().live_sessions
    }

    pub fn last_options(&self) -> Option<SessionOptions> {
        self.inner.state().last_options.clone()
    }
}

impl BrokerTransport for SimulatedBroker {
    fn open(
        &self,
        options: &SessionOptions,
    ) -> Result<(Arc<dyn SessionClient>, Box<dyn SessionDriver>), TransportError> {
        {
            let mut state = self.inner.state();
            state.sessions_opened += 1;
            state.live_sessions += 1;
            state.connected = false;
            state.drop_pending = false;
            state.disconnect_requested = false;
            state.last_options = Some(options.clone());
        }
        info!("Simulated broker opened session for '{}'", options.client_id);

        Ok((
            Arc::new(SimulatedClient {
                inner: self.inner.clone(),
            }),
            Box::new(SimulatedDriver {
                inner: self.inner.clone(),
            }),
        ))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

struct SimulatedClient {
    inner: Arc<Inner>,
}

impl SessionClient for SimulatedClient {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.inner.state();
            if !state.connected {
                return Err(TransportError::Request("not connected".to_string()));
            }
            let message = PublishedMessage::from_topic(topic, payload, qos);
            debug!("Simulated broker received {}", message.render());
            state.messages.push(message);
            Ok(())
        })
    }

    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.inner.state().disconnect_requested = true;
            self.inner.wakeup.notify_one();
            Ok(())
        })
    }
}

struct SimulatedDriver {
    inner: Arc<Inner>,
}

impl SimulatedDriver {
    /// Non-blocking step; `None` means nothing happened yet
    fn step(&self) -> Option<Result<DriverEvent, TransportError>> {
        let mut state = self.inner.state();

        if state.disconnect_requested {
            state.disconnect_requested = false;
            state.connected = false;
            return Some(Ok(DriverEvent::Closed));
        }

        if !state.connected {
            if let Some(reason) = state.refusal.clone() {
                return Some(Err(TransportError::Refused(reason)));
            }
            if !state.reachable {
                return Some(Err(TransportError::Dropped(
                    "broker unreachable".to_string(),
                )));
            }
            state.connected = true;
            return Some(Ok(DriverEvent::Connected));
        }

        if state.drop_pending {
            state.drop_pending = false;
            state.connected = false;
            return Some(Err(TransportError::Dropped(
                "connection reset by peer".to_string(),
            )));
        }

        None
    }
}

impl SessionDriver for SimulatedDriver {
    fn poll(&mut self) -> BoxFuture<'_, Result<DriverEvent, TransportError>> {
        Box::pin(async move {
            loop {
                if let Some(event) = self.step() {
                    return event;
                }
                self.inner.wakeup.notified().await;
            }
        })
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.live_sessions = state.live_sessions.saturating_sub(1);
        state.connected = false;
    }
}
