//! Configuration for cache, poller and daemon processes.
//!
//! Settings are layered with `figment`, lowest to highest precedence:
//!
//! 1. Built-in defaults ([`Settings::default`])
//! 2. A TOML file (`config/rust_ics.toml` unless another path is given)
//! 3. Environment variables prefixed with `RUST_ICS_`; nested keys are separated
//!    by a double underscore, e.g. `RUST_ICS_CACHE__PORT=14870`.
//!
//! Setups are described in the same file: each `[setups.<name>]` table lists the
//! devices it creates together with their class and configured parameters.
//!
//! ```toml
//! [application]
//! session = "demo"
//!
//! [setups.motors.devices.m1]
//! class = "virtual_motor"
//! abslimits = [-100.0, 100.0]
//! speed = 5.0
//! ```

use crate::daemon::auth::{AccessLevel, AuthMethod, HashAlgorithm};
use crate::error::{AppResult, IcsError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/rust_ics.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Setup name -> setup definition.
    #[serde(default)]
    pub setups: BTreeMap<String, SetupConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationConfig {
    #[serde(default = "default_name")]
    pub name: String,
    /// One of trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Session name; prefixes session-wide cache keys such as `<session>/mastersetup`.
    #[serde(default = "default_session")]
    pub session: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    /// Directory for the day-file store. Without it the cache is memory only.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,
    /// Lifetime of an advisory lock that is never released.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_s: f64,
    /// Maximum number of writes buffered while the server is unreachable.
    #[serde(default = "default_write_buffer_limit")]
    pub write_buffer_limit: usize,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Follow the setups loaded by the master session.
    #[serde(default = "default_true")]
    pub autosetup: bool,
    /// Setups that are always polled.
    #[serde(default)]
    pub alwayspoll: Vec<String>,
    /// Devices that are never polled.
    #[serde(default)]
    pub blacklist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PasswdEntry {
    pub user: String,
    /// Plain password or its hex digest under the configured algorithm.
    pub hash: String,
    pub level: AccessLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub passwd: Vec<PasswdEntry>,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// Wall-clock ceiling for a dry run.
    #[serde(default = "default_simulation_timeout")]
    pub simulation_timeout_s: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SetupConfig {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

/// Configured class and parameters of one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub class: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, Value>,
}

impl DeviceConfig {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            params: BTreeMap::new(),
        }
    }

    /// Builder-style helper used by tests and programmatic setups.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "rust_ics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_session() -> String {
    "ics".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cache_port() -> u16 {
    14869
}

fn default_daemon_port() -> u16 {
    1301
}

fn default_lock_ttl() -> f64 {
    60.0
}

fn default_write_buffer_limit() -> usize {
    10_000
}

fn default_request_timeout() -> u64 {
    3000
}

fn default_reconnect_interval() -> u64 {
    1000
}

fn default_simulation_timeout() -> f64 {
    600.0
}

fn default_true() -> bool {
    true
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            session: default_session(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_cache_port(),
            store_dir: None,
            lock_ttl_s: default_lock_ttl(),
            write_buffer_limit: default_write_buffer_limit(),
            request_timeout_ms: default_request_timeout(),
            reconnect_interval_ms: default_reconnect_interval(),
        }
    }
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            autosetup: true,
            alwayspoll: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_daemon_port(),
            auth_method: AuthMethod::default(),
            passwd: Vec::new(),
            hash_algorithm: HashAlgorithm::default(),
            simulation_timeout_s: default_simulation_timeout(),
        }
    }
}

// ============================================================================
// Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load settings from a specific file. A missing file leaves the defaults
    /// in place; a malformed one is an error.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_ICS_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (defaults fill the gaps).
    pub fn from_toml(text: &str) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(text))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Checks:
    /// - log level is one of trace, debug, info, warn, error
    /// - session name is non-empty and contains no `/`
    /// - ports are non-zero; `list` authentication has at least one entry
    /// - timeouts and limits are positive
    /// - every device has a class and is defined by at most one setup
    /// - `alwayspoll` only names known setups
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(IcsError::settings(format!(
                "invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.session.is_empty() || self.application.session.contains('/') {
            return Err(IcsError::settings(format!(
                "invalid session name '{}'",
                self.application.session
            )));
        }

        if self.cache.port == 0 || self.daemon.port == 0 {
            return Err(IcsError::settings("cache.port and daemon.port must be non-zero"));
        }
        if self.daemon.auth_method == AuthMethod::List && self.daemon.passwd.is_empty() {
            return Err(IcsError::settings(
                "daemon.auth_method 'list' requires at least one passwd entry",
            ));
        }
        if self.cache.lock_ttl_s <= 0.0 {
            return Err(IcsError::settings("cache.lock_ttl_s must be positive"));
        }
        if self.cache.request_timeout_ms == 0 {
            return Err(IcsError::settings("cache.request_timeout_ms must be positive"));
        }
        if self.daemon.simulation_timeout_s <= 0.0 {
            return Err(IcsError::settings(
                "daemon.simulation_timeout_s must be positive",
            ));
        }

        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for (setup, config) in &self.setups {
            for (device, dconfig) in &config.devices {
                if dconfig.class.is_empty() {
                    return Err(IcsError::config(
                        device.as_str(),
                        format!("device in setup '{}' has no class", setup),
                    ));
                }
                if device.contains('/') {
                    return Err(IcsError::config(
                        device.as_str(),
                        "device names must not contain '/'",
                    ));
                }
                if let Some(other) = owners.insert(device.as_str(), setup.as_str()) {
                    return Err(IcsError::config(
                        device.as_str(),
                        format!("defined by both setup '{}' and '{}'", other, setup),
                    ));
                }
            }
        }

        for setup in &self.poller.alwayspoll {
            if !self.setups.contains_key(setup) {
                return Err(IcsError::settings(format!(
                    "poller.alwayspoll names unknown setup '{}'",
                    setup
                )));
            }
        }

        Ok(())
    }

    /// Find the configuration of a device across all setups.
    pub fn device(&self, name: &str) -> Option<(&str, &DeviceConfig)> {
        self.setups.iter().find_map(|(setup, config)| {
            config
                .devices
                .get(name)
                .map(|device| (setup.as_str(), device))
        })
    }

    /// Address of the cache server as `host:port`.
    pub fn cache_address(&self) -> String {
        format!("{}:{}", self.cache.host, self.cache.port)
    }

    /// Address of the daemon server as `host:port`.
    pub fn daemon_address(&self) -> String {
        format!("{}:{}", self.daemon.host, self.daemon.port)
    }
}
