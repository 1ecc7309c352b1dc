//! Broker configuration tuple and server URI parsing
//!
//! [`BrokerConfig`] is the resolved `(server_uri, client_id, username, password, topic)`
//! tuple handed to the connection manager. It is validated before any network I/O
//! happens, so a bad configuration never opens a session.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Reasons a [`BrokerConfig`] is rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyField(ConfigField),

    #[error("Unsupported URI scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid port in server URI: {0}")]
    InvalidPort(String),

    #[error("Missing host in server URI: {0}")]
    MissingHost(String),
}

/// The five fields of a broker configuration, used for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    ServerUri,
    ClientId,
    Username,
    Password,
    Topic,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfigField::ServerUri => "server_uri",
            ConfigField::ClientId => "client_id",
            ConfigField::Username => "username",
            ConfigField::Password => "password",
            ConfigField::Topic => "topic",
        };
        f.write_str(name)
    }
}

/// Connection parameters for one broker session
///
/// Immutable for the lifetime of a session; the connection manager clones what it
/// needs when the session is opened.
#[derive(Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct BrokerConfig {
    pub server_uri: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub topic: String,
}

// Keeps the password out of logs
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("server_uri", &self.server_uri)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("topic", &self.topic)
            .finish()
    }
}

impl BrokerConfig {
    pub fn new(
        server_uri: impl Into<String>,
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            server_uri: server_uri.into(),
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
            topic: topic.into(),
        }
    }

    /// Checks that every field is non-empty and that the server URI parses
    pub fn validate(&self) -> Result<ServerAddress, ConfigError> {
        let fields = [
            (ConfigField::ServerUri, &self.server_uri),
            (ConfigField::ClientId, &self.client_id),
            (ConfigField::Username, &self.username),
            (ConfigField::Password, &self.password),
            (ConfigField::Topic, &self.topic),
        ];

        if let Some((field, _)) = fields.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ConfigError::EmptyField(*field));
        }

        ServerAddress::parse(&self.server_uri)
    }
}

/// Host, port and transport security parsed from a server URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl ServerAddress {
    /// Parses `scheme://host[:port]`; a bare `host[:port]` is plain TCP
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let (scheme, rest) = match uri.find("://") {
            Some(pos) => (&uri[..pos], &uri[pos + 3..]),
            None => ("tcp", uri),
        };

        let tls = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        // Drop any path component, brokers don't use one
        let authority = rest.split('/').next().unwrap_or_default();

        // `[v6addr]:port` keeps its colons inside the brackets
        let (host, port_str) = match authority.strip_prefix('[') {
            Some(bracketed) => match bracketed.split_once(']') {
                Some((host, "")) => (host, None),
                Some((host, tail)) => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(ConfigError::InvalidPort(tail.to_string())),
                },
                None => return Err(ConfigError::MissingHost(uri.to_string())),
            },
            None => match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            },
        };

        let port = match port_str {
            Some(port_str) => port_str
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidPort(port_str.to_string()))?,
            None if tls => DEFAULT_TLS_PORT,
            None => DEFAULT_TCP_PORT,
        };

        if host.is_empty() {
            return Err(ConfigError::MissingHost(uri.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}
