//! Transport seam between the connection manager and the wire
//!
//! A session is split the way rumqttc splits it: a cloneable [`SessionClient`] used to
//! enqueue requests, and a [`SessionDriver`] that must be polled to move packets and
//! to reconnect after the transport drops. The connection manager keeps the driver on
//! its supervisor task and shares the client with the publishing side.

use crate::config::ServerAddress;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// MQTT delivery guarantee
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn as_u8(&self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The broker answered the handshake with a refusal (bad credentials, ...)
    #[error("Connection refused by broker: {0}")]
    Refused(String),

    /// The network connection was lost or could not be established
    #[error("Transport dropped: {0}")]
    Dropped(String),

    /// A request could not be handed to the session
    #[error("Request failed: {0}")]
    Request(String),

    /// The session could not be created from the options
    #[error("Invalid session options: {0}")]
    Options(String),
}

/// What a driver poll observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverEvent {
    /// Handshake accepted, the session is usable
    Connected,
    /// Our own disconnect request went out; the driver is done
    Closed,
    /// Any other traffic (acks, pings, outgoing packets)
    Activity,
}

/// Everything needed to open one broker session
#[derive(Clone)]
pub struct SessionOptions {
    pub address: ServerAddress,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    /// Capacity of the client's request channel
    pub request_capacity: usize,
}

impl std::fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionOptions")
            .field("address", &self.address)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .field("request_capacity", &self.request_capacity)
            .finish()
    }
}

/// Request side of a live session
pub trait SessionClient: Send + Sync {
    fn publish<'a>(
        &'a self,
        topic: &'a str,
        qos: QoS,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Asks the broker for a clean disconnect; does not wait for it
    fn disconnect(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Event-loop side of a live session
///
/// After an error the next `poll` attempts to re-establish the connection.
pub trait SessionDriver: Send {
    fn poll(&mut self) -> BoxFuture<'_, Result<DriverEvent, TransportError>>;
}

/// Factory for broker sessions
pub trait BrokerTransport: Send + Sync {
    fn open(
        &self,
        options: &SessionOptions,
    ) -> Result<(Arc<dyn SessionClient>, Box<dyn SessionDriver>), TransportError>;

    fn name(&self) -> &'static str;
}
