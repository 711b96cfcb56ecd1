use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Broker endpoint and credentials for a single connection attempt.
///
/// The config is taken by value when a connection starts and is not
/// mutated afterwards. It is also what gets persisted as the broker
/// profile in the settings file, so all fields are serde-derived.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
        }
    }
}

/// Validation failure for a [`BrokerConfig`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,
    #[error("port must be in range 1-65535")]
    InvalidPort,
}

impl BrokerConfig {
    /// Checks the invariants that must hold before any I/O is attempted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        Ok(())
    }

    /// Websocket URL for this broker: `ws://host:port/mqtt`, or `wss` with TLS.
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "wss" } else { "ws" };
        format!("{}://{}:{}/mqtt", scheme, self.host.trim(), self.port)
    }

    /// Username/password pair, if a username was given.
    pub fn credentials(&self) -> Option<(String, String)> {
        let user = self.username.as_deref()?.trim();
        if user.is_empty() {
            return None;
        }
        let pass = self.password.as_deref().unwrap_or("").to_string();
        Some((user.to_string(), pass))
    }
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url())
    }
}
