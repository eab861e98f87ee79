//! Configuration handling for the Bulletproof controller
//!
//! Read-only: the file is loaded at startup and never written back. Every key
//! is optional; a missing file means all defaults.

use crate::control::protocol::{
    ConnectRequest, DEFAULT_BIND, DEFAULT_LISTEN, Integration, Provider, normalize_country,
};
use crate::supervisor::{SearchPaths, SupervisorConfig};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU16;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub connection: ConnectionSettings,
    pub timings: Timings,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Control-plane address handed to the daemon as `-addr`
    pub listen: String,
    /// Explicit daemon path; takes precedence over `BACKEND_BIN`
    pub binary: Option<PathBuf>,
    /// Packaged resources root (contains `bin/<platform>-<arch>/`)
    pub resources_dir: Option<PathBuf>,
    /// Show daemon stdout/stderr in this terminal
    pub inherit_stdio: bool,
    pub request_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            binary: None,
            resources_dir: None,
            inherit_stdio: true,
            request_timeout_ms: 10_000,
        }
    }
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Settings a connect request is built from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub provider: Provider,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub exit_country: Option<String>,
    /// WARP license key
    pub key: Option<String>,
    pub integration: Integration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            provider: Provider::Warp,
            server: None,
            port: None,
            exit_country: Some("US".to_string()),
            key: None,
            integration: Integration::Direct,
        }
    }
}

impl ConnectionSettings {
    /// Build a fresh connect request from these settings
    pub fn to_request(&self) -> Result<ConnectRequest, ConfigError> {
        let mut request = ConnectRequest::new(self.provider);
        request.server = non_empty(self.server.as_deref());
        request.options.key = non_empty(self.key.as_deref());
        request.options.integration = self.integration;

        if let Some(port) = self.port {
            request.port = Some(NonZeroU16::new(port).ok_or(ConfigError::InvalidValue {
                field: "port",
                value: port.to_string(),
            })?);
        }

        if let Some(country) = non_empty(self.exit_country.as_deref()) {
            let code = normalize_country(&country).ok_or(ConfigError::InvalidValue {
                field: "exit_country",
                value: country,
            })?;
            request.exit_country = Some(code);
        }

        Ok(request)
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Intervals and timeouts, in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Status poll interval while waiting for a connect
    pub status_poll_ms: u64,
    /// Overall connect window
    pub connect_timeout_ms: u64,
    /// Pause after a port probe that found nothing listening
    pub probe_grace_ms: u64,
    /// Coarse reconciliation interval
    pub coarse_interval_ms: u64,
    /// Fine reconciliation interval, only while connected
    pub fine_interval_ms: u64,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    /// Grace period before a stop escalates to a forced tree kill
    pub stop_grace_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            status_poll_ms: 300,
            connect_timeout_ms: 75_000,
            probe_grace_ms: 800,
            coarse_interval_ms: 2_000,
            fine_interval_ms: 4_000,
            health_interval_ms: 300,
            health_timeout_ms: 5_000,
            stop_grace_ms: 2_000,
        }
    }
}

impl Timings {
    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_millis(self.probe_grace_ms)
    }

    pub fn coarse_interval(&self) -> Duration {
        Duration::from_millis(self.coarse_interval_ms.max(1))
    }

    pub fn fine_interval(&self) -> Duration {
        Duration::from_millis(self.fine_interval_ms.max(1))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Reference host for latency samples
    pub latency_host: String,
    /// Bind to probe when the daemon reported none
    pub default_bind: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            latency_host: "1.1.1.1:443".to_string(),
            default_bind: DEFAULT_BIND.to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load `path`, or defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            listen: self.daemon.listen.clone(),
            search: SearchPaths::from_env(
                self.daemon.binary.clone(),
                self.daemon.resources_dir.clone(),
            ),
            inherit_stdio: self.daemon.inherit_stdio,
            health_interval: self.timings.health_interval(),
            health_timeout: self.timings.health_timeout(),
            stop_grace: self.timings.stop_grace(),
        }
    }
}

/// Default config location
///
/// `$XDG_CONFIG_HOME/bulletproof/config.toml`, else
/// `$HOME/.config/bulletproof/config.toml`, else the platform config dir.
pub fn get_config_path() -> PathBuf {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .or_else(dirs::config_dir)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("bulletproof").join("config.toml")
}
