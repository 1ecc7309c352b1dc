//! # Persistence Module
//!
//! ## Why This Module Exists
//! The bridge reads its broker credentials and tunables from a single TOML file in the
//! user's config directory. This module defines that file's shape ([`AppConfig`]) and
//! the async load/save helpers around it.
//!
//! ## Layout
//! ```toml
//! transport = "mqtt"          # or "simulated" for a dry run
//!
//! [broker]                    # server_uri, client_id, username, password, topic
//! [connection]                # qos, keep_alive_secs, connect_timeout_ms, ...
//! [connection.reconnect]      # base_ms, max_ms, max_attempts
//! [bridge]                    # queue_capacity, stop_timeout_ms, publish_retry_delay_ms
//! [sensor]                    # simulated sensor shape
//! ```
//!
//! ## Error Handling Strategy
//! File operations return `color_eyre::Result` with context on every step. Missing
//! sections fall back to defaults so an old or hand-trimmed file still loads.

pub mod config_store;

use crate::bridge::BridgeSettings;
use crate::config::BrokerConfig;
use crate::mqtt::ConnectionSettings;
use crate::sensor::SimulatedSensorSettings;
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use config_store::{
    default_config_path, ensure_default_config, load_config, load_or_create, save_config,
};

/// Which broker transport the binary wires up
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// rumqttc against a real broker
    #[default]
    Mqtt,
    /// In-process broker, nothing leaves the machine
    Simulated,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransportKind::Mqtt => write!(f, "mqtt"),
            TransportKind::Simulated => write!(f, "simulated"),
        }
    }
}

/// Complete contents of the settings file
///
/// Plain values must come before the tables for the TOML serializer, so `transport`
/// stays the first field.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub transport: TransportKind,
    pub broker: BrokerConfig,
    pub connection: ConnectionSettings,
    pub bridge: BridgeSettings,
    pub sensor: SimulatedSensorSettings,
}

impl AppConfig {
    /// Fills in a client id when none is configured; returns whether one was generated
    pub fn ensure_client_id(&mut self) -> bool {
        if !self.broker.client_id.trim().is_empty() {
            return false;
        }
        self.broker.client_id = generate_client_id();
        true
    }
}

/// `luxbridge-<hex millis>`, unique enough per install
pub fn generate_client_id() -> String {
    format!("luxbridge-{:x}", Local::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_missing_client_id_once() {
        let mut config = AppConfig::default();
        assert!(config.ensure_client_id());
        assert!(config.broker.client_id.starts_with("luxbridge-"));

        let id = config.broker.client_id.clone();
        assert!(!config.ensure_client_id());
        assert_eq!(config.broker.client_id, id);
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            transport = "simulated"

            [broker]
            server_uri = "tcp://broker.local:1883"
            topic = "home/lux"

            [connection.reconnect]
            max_attempts = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.transport, TransportKind::Simulated);
        assert_eq!(config.broker.topic, "home/lux");
        assert!(config.broker.username.is_empty());
        assert_eq!(config.connection.reconnect.max_attempts, Some(5));
        assert_eq!(config.connection.reconnect.base_ms, 1_000);
        assert_eq!(config.bridge, BridgeSettings::default());
    }

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&AppConfig::default()).unwrap();
        assert!(text.starts_with("transport = \"mqtt\""));
        assert!(text.contains("[connection.reconnect]"));
    }
}
