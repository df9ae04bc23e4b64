//! Explicit process context.
//!
//! A [`Context`] bundles what every device and service needs: the cache
//! front-end, the execution mode, the clock, the device factory registry, the
//! live device instances and the privilege level of the running script. It is
//! created once per process (and once per dry-run simulation) and handed to
//! constructors as `Arc<Context>`.

use crate::cache::Cache;
use crate::clock::Clock;
use crate::config::{DeviceConfig, Settings};
use crate::daemon::auth::{self, AccessLevel};
use crate::device::registry::DeviceRegistry;
use crate::device::Device;
use crate::error::{AppResult, IcsError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Execution mode gating hardware mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full control; the only mode that may move hardware from scripts.
    Master,
    /// Read-only observer.
    Slave,
    /// Dry run: hardware is never touched, time is virtual.
    Simulation,
    /// Like master, for service work.
    Maintenance,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mode::Master => "master",
            Mode::Slave => "slave",
            Mode::Simulation => "simulation",
            Mode::Maintenance => "maintenance",
        };
        f.write_str(name)
    }
}

/// Cooperative cancellation hook; returns an error when the running script
/// must stop.
pub type Breakpoint = Arc<dyn Fn() -> AppResult<()> + Send + Sync>;

pub struct Context {
    settings: Arc<Settings>,
    cache: Option<Arc<dyn Cache>>,
    mode: RwLock<Mode>,
    clock: Clock,
    factories: Arc<DeviceRegistry>,
    devices: RwLock<HashMap<String, Arc<dyn Device>>>,
    access: RwLock<AccessLevel>,
    breakpoint: RwLock<Option<Breakpoint>>,
}

pub struct ContextBuilder {
    settings: Arc<Settings>,
    cache: Option<Arc<dyn Cache>>,
    mode: Mode,
    clock: Clock,
    factories: Option<Arc<DeviceRegistry>>,
}

impl ContextBuilder {
    pub fn cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn factories(mut self, factories: Arc<DeviceRegistry>) -> Self {
        self.factories = Some(factories);
        self
    }

    pub fn build(self) -> Arc<Context> {
        Arc::new(Context {
            settings: self.settings,
            cache: self.cache,
            mode: RwLock::new(self.mode),
            clock: self.clock,
            factories: self
                .factories
                .unwrap_or_else(|| Arc::new(DeviceRegistry::with_builtin())),
            devices: RwLock::new(HashMap::new()),
            access: RwLock::new(AccessLevel::Admin),
            breakpoint: RwLock::new(None),
        })
    }
}

impl Context {
    pub fn builder(settings: Arc<Settings>) -> ContextBuilder {
        ContextBuilder {
            settings,
            cache: None,
            mode: Mode::Master,
            clock: Clock::Real,
            factories: None,
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read()
    }

    pub fn set_mode(&self, mode: Mode) {
        let old = std::mem::replace(&mut *self.mode.write(), mode);
        if old != mode {
            tracing::info!(%old, new = %mode, "execution mode changed");
        }
    }

    pub fn is_simulation(&self) -> bool {
        self.mode() == Mode::Simulation
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Current time on this context's clock.
    pub fn now(&self) -> f64 {
        self.clock.time()
    }

    pub fn factories(&self) -> &Arc<DeviceRegistry> {
        &self.factories
    }

    /// Privilege level of the script currently executing.
    pub fn access_level(&self) -> AccessLevel {
        *self.access.read()
    }

    pub fn set_access_level(&self, level: AccessLevel) {
        *self.access.write() = level;
    }

    /// The single privilege check used by devices and daemon commands.
    pub fn require(&self, required: AccessLevel, device: Option<&str>, action: &str) -> AppResult<()> {
        auth::require(self.access_level(), required, device, action)
    }

    pub fn set_breakpoint(&self, breakpoint: Option<Breakpoint>) {
        *self.breakpoint.write() = breakpoint;
    }

    /// Give the running script a chance to be paused or stopped.
    pub fn checkpoint(&self) -> AppResult<()> {
        let breakpoint = self.breakpoint.read().clone();
        match breakpoint {
            Some(check) => check(),
            None => Ok(()),
        }
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub fn device(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices.read().get(&name.to_lowercase()).cloned()
    }

    pub fn device_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .read()
            .values()
            .map(|d| d.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Look up a device or fail with a usage error naming it.
    pub fn require_device(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        self.device(name).ok_or_else(|| IcsError::Usage {
            device: Some(name.to_string()),
            message: "device not found".to_string(),
        })
    }

    /// Create a device from an explicit configuration and register it.
    pub async fn create_device_from(
        self: &Arc<Self>,
        name: &str,
        config: &DeviceConfig,
    ) -> AppResult<Arc<dyn Device>> {
        if let Some(existing) = self.device(name) {
            return Ok(existing);
        }
        let device = self
            .factories
            .create(name, config, Arc::clone(self))
            .await
            .map_err(|err| err.with_device(name))?;
        self.devices
            .write()
            .insert(name.to_lowercase(), Arc::clone(&device));
        tracing::debug!(device = %name, class = %config.class, "device created");
        Ok(device)
    }

    /// Create a device configured in one of the settings' setups.
    pub async fn create_device(self: &Arc<Self>, name: &str) -> AppResult<Arc<dyn Device>> {
        let (_, config) = self.settings.device(name).ok_or_else(|| {
            IcsError::config(name, "device is not configured in any setup")
        })?;
        let config = config.clone();
        self.create_device_from(name, &config).await
    }

    /// Create every device of `setup`. Aliases are created last so their
    /// targets already exist.
    pub async fn load_setup(self: &Arc<Self>, setup: &str) -> AppResult<Vec<Arc<dyn Device>>> {
        let config = self
            .settings
            .setups
            .get(setup)
            .ok_or_else(|| IcsError::settings(format!("setup '{}' does not exist", setup)))?
            .clone();
        let mut ordered: Vec<(&String, &DeviceConfig)> = config.devices.iter().collect();
        ordered.sort_by_key(|(_, c)| c.class == "alias");
        let mut created = Vec::with_capacity(ordered.len());
        for (name, dconfig) in ordered {
            created.push(self.create_device_from(name, dconfig).await?);
        }
        Ok(created)
    }

    /// Shut down and forget a device.
    pub async fn destroy_device(&self, name: &str) {
        let removed = self.devices.write().remove(&name.to_lowercase());
        if let Some(device) = removed {
            device.shutdown().await;
        }
    }

    /// Shut down all devices.
    pub async fn shutdown(&self) {
        let devices: Vec<Arc<dyn Device>> = self.devices.write().drain().map(|(_, d)| d).collect();
        for device in devices {
            device.shutdown().await;
        }
    }
}
