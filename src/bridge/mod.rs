//! # Bridge Module
//!
//! Moves light samples from a reading source to the broker.
//!
//! ## Module Architecture
//!
//! ```text
//! bridge/
//! ├── controller.rs  - Start/stop toggle, run supervisor, sampling flow
//! ├── forwarder.rs   - Forwarding flow (statum state machine)
//! ├── queue.rs       - Bounded drop-oldest publish queue
//! └── status.rs      - Status snapshot and shared counters
//! ```
//!
//! The sampling flow never blocks on the network: it only enqueues. The forwarding
//! flow is the only caller of `publish`, so an outage upstream costs at most
//! `queue_capacity` samples of history and never stalls the sensor.

pub mod controller;
pub mod forwarder;
pub mod queue;
pub mod status;

pub use controller::{Bridge, BridgeError, BridgeSettings};
pub use queue::{PublishQueue, QueueError};
pub use status::BridgeStatus;
