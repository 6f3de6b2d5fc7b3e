//! Connect options and broker settings.
//!
//! `BusOptions` is the programmatic surface shared by clients, brokers and
//! bridges. The broker binary additionally loads `BrokerSettings` from an
//! optional config file plus `CROSSBUS__*` environment overrides.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable prefix for settings overrides.
///
/// Nested keys use `__` as separator, e.g. `CROSSBUS__PORT=45010`.
pub const CONFIG_ENV_PREFIX: &str = "CROSSBUS";

/// Environment variable naming an alternate settings file.
pub const CONFIG_FILE_ENV_VAR: &str = "CROSSBUS_CONFIG";

/// Default settings file stem (crossbus.yaml, crossbus.toml, ...).
const DEFAULT_CONFIG_FILE: &str = "crossbus";

/// Connect timeout applied when the options leave it unset.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;

/// Options accepted by connect/listen across the crate.
///
/// `port` selects TCP on 127.0.0.1, `path` a Unix domain socket; they are
/// mutually exclusive. For a bridge, `server: true` hosts the broker in
/// process instead of dialing one, and omitting both port and path detaches
/// the socket side entirely.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BusOptions {
    /// Explicit peer name; generated from the process descriptor when empty.
    pub peer_name: Option<String>,
    /// Connect timeout in milliseconds.
    pub timeout_ms: Option<u64>,
    /// TCP port on 127.0.0.1.
    pub port: Option<u16>,
    /// Unix domain socket path (unix only).
    pub path: Option<PathBuf>,
    /// Bridge only: host the broker in process.
    pub server: bool,
    /// Deliver values instead of encoded frames on host channels.
    pub use_native_serialization: bool,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            peer_name: None,
            timeout_ms: None,
            port: None,
            path: None,
            server: false,
            use_native_serialization: true,
        }
    }
}

impl BusOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peer_name(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_server(mut self, server: bool) -> Self {
        self.server = server;
        self
    }

    pub fn with_native_serialization(mut self, native: bool) -> Self {
        self.use_native_serialization = native;
        self
    }

    /// True when the options name a socket endpoint.
    pub fn has_socket(&self) -> bool {
        self.port.is_some() || self.path.is_some()
    }

    /// Connect timeout with the default applied.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS))
    }

    /// Reject contradictory combinations.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.port.is_some() && self.path.is_some() {
            return Err(crate::error::BusError::InvalidOptions(
                "port and path are mutually exclusive".into(),
            ));
        }
        if self.server && !self.has_socket() {
            return Err(crate::error::BusError::InvalidOptions(
                "server mode needs a port or a path to listen on".into(),
            ));
        }
        Ok(())
    }
}

/// Settings of the standalone broker binary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
}

impl BrokerSettings {
    /// Load from the optional settings file, then environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let config_file = std::env::var(CONFIG_FILE_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Config::builder()
            .add_source(File::with_name(&config_file).required(false))
            .add_source(Environment::with_prefix(CONFIG_ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Listen options for the broker.
    pub fn into_options(self, default_port: u16) -> BusOptions {
        let mut options = BusOptions::new();
        match (self.port, self.path) {
            (_, Some(path)) => options.path = Some(path),
            (Some(port), None) => options.port = Some(port),
            (None, None) => options.port = Some(default_port),
        }
        options
    }
}
