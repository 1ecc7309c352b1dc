//! # MQTT Integration Module
//!
//! Broker side of the bridge: a connection manager with an explicit, observable state
//! machine on top of a pluggable transport.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── backoff.rs     - Exponential reconnect backoff
//! ├── connection.rs  - Connection state machine and session supervisor
//! ├── message.rs     - Published message representation
//! ├── rumqtt.rs      - rumqttc transport (production)
//! ├── simulated.rs   - In-process broker (dry runs, tests)
//! └── transport.rs   - Transport traits and session options
//! ```
//!
//! ## Delivery Model
//!
//! Sessions are opened with `clean_session = false` so the broker keeps session
//! state across reconnects, and samples go out at-least-once by default. A transport
//! drop is recovered by the supervisor with exponential backoff (1s base, doubling,
//! 60s cap); callers only see the state move through `Reconnecting`.

pub mod backoff;
pub mod connection;
pub mod message;
pub mod rumqtt;
pub mod simulated;
pub mod transport;

pub use backoff::{Backoff, BackoffSettings};
pub use connection::{
    ConnectionError, ConnectionManager, ConnectionMetrics, ConnectionSettings, ConnectionState,
};
pub use message::PublishedMessage;
pub use rumqtt::RumqttTransport;
pub use simulated::SimulatedBroker;
pub use transport::{BrokerTransport, QoS, SessionOptions, TransportError};
