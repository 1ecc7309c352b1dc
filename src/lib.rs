//! luxbridge: forwards ambient-light readings to an MQTT broker
//!
//! ```text
//! sensor ──► bridge (queue, forwarder) ──► mqtt (connection manager) ──► broker
//! ```
//!
//! The bridge is switched on and off with [`bridge::Bridge::start`] and
//! [`bridge::Bridge::stop`]; connection health is observable through
//! [`mqtt::ConnectionManager::subscribe`].

pub mod bridge;
pub mod config;
pub mod mqtt;
pub mod persistence;
pub mod sensor;
