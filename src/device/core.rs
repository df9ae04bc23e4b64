//! Per-device parameter state and its synchronisation with the cache.
//!
//! [`DeviceCore`] is embedded in every device. It owns the in-process parameter
//! values and implements the binding contract between them, the hardware
//! (through reader/writer closures supplied by the device class) and the
//! shared cache:
//!
//! - **init**: each parameter comes from the cache, else a live hardware read,
//!   else the configuration, else its default. When cache and configuration
//!   disagree the configuration wins unless the parameter prefers the cache
//!   (and its configured value has not changed since the last run); the winner
//!   is written back and a warning is logged. A mandatory parameter found in
//!   neither place is a configuration error.
//! - **get**: volatile parameters are read live (never in simulation) and only
//!   written to the cache when they changed; other parameters return the local
//!   value, or a fresher cached one.
//! - **set**: refused in slave mode; in simulation only the local value
//!   changes; otherwise the hardware is written first and the cache updated on
//!   success.
//!
//! # Architecture
//!
//! ```text
//! DeviceCore
//!   ├─ specs: Vec<ParamSpec>              (merged class declarations)
//!   ├─ params: name -> (value, time)      (in-process values)
//!   ├─ readers / writers                  (hardware closures, optional)
//!   ├─ hooks                              (run on init, set and cache updates)
//!   └─ sim: SimState                      (dry-run value tracking)
//! ```

use super::param::{format_value, ParamSpec, FMTSTR, MAXAGE};
use crate::cache::{CacheEntry, CallbackId};
use crate::context::{Context, Mode};
use crate::error::{AppResult, IcsError};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Live read of a volatile parameter.
pub type ParamReader = Arc<dyn Fn() -> BoxFuture<'static, AppResult<Value>> + Send + Sync>;

/// Hardware write of a settable parameter.
pub type ParamWriter = Arc<dyn Fn(Value) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// Reaction to a new parameter value (from init, `set` or another process).
pub type UpdateHook = Arc<dyn Fn(&Value) + Send + Sync>;

/// Cache key holding the configuration a device was last created with.
pub const LASTCONFIG_PREFIX: &str = "_lastconfig_";

#[derive(Debug, Clone)]
struct Slot {
    value: Value,
    time: f64,
}

/// Dry-run tracking of the main value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimState {
    pub value: Option<Value>,
    pub old_value: Option<Value>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Virtual time the last simulated movement started.
    pub started: Option<f64>,
}

impl SimState {
    fn track(&mut self, value: Value) {
        if let Some(x) = value.as_f64() {
            self.min = Some(self.min.map_or(x, |m| m.min(x)));
            self.max = Some(self.max.map_or(x, |m| m.max(x)));
        }
        self.old_value = self.value.replace(value);
    }
}

pub struct DeviceCore {
    name: String,
    class: String,
    specs: Vec<ParamSpec>,
    config: BTreeMap<String, Value>,
    ctx: Arc<Context>,
    params: Arc<RwLock<HashMap<String, Slot>>>,
    readers: HashMap<String, ParamReader>,
    writers: HashMap<String, ParamWriter>,
    hooks: HashMap<String, UpdateHook>,
    subscriptions: Mutex<Vec<CallbackId>>,
    sim: Mutex<SimState>,
}

impl DeviceCore {
    pub fn new(
        name: impl Into<String>,
        class: impl Into<String>,
        specs: Vec<ParamSpec>,
        config: BTreeMap<String, Value>,
        ctx: Arc<Context>,
    ) -> Self {
        Self {
            name: name.into(),
            class: class.into(),
            specs,
            config,
            ctx,
            params: Arc::default(),
            readers: HashMap::new(),
            writers: HashMap::new(),
            hooks: HashMap::new(),
            subscriptions: Mutex::new(Vec::new()),
            sim: Mutex::new(SimState::default()),
        }
    }

    /// Connect a live reader; the parameter should be declared volatile.
    pub fn reader<F, Fut>(mut self, param: &str, f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<Value>> + Send + 'static,
    {
        let reader: ParamReader = Arc::new(move || -> BoxFuture<'static, AppResult<Value>> {
            Box::pin(f())
        });
        self.readers.insert(param.to_string(), reader);
        self
    }

    /// Connect a hardware writer run by `set` before the value is stored.
    pub fn writer<F, Fut>(mut self, param: &str, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AppResult<()>> + Send + 'static,
    {
        let writer: ParamWriter = Arc::new(move |v| -> BoxFuture<'static, AppResult<()>> {
            Box::pin(f(v))
        });
        self.writers.insert(param.to_string(), writer);
        self
    }

    pub fn on_update(mut self, param: &str, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.hooks.insert(param.to_string(), Arc::new(hook));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn mode(&self) -> Mode {
        self.ctx.mode()
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    pub fn spec(&self, param: &str) -> Option<&ParamSpec> {
        self.specs.iter().find(|s| s.name == param)
    }

    /// Configured (setup) parameter values.
    pub fn config(&self) -> &BTreeMap<String, Value> {
        &self.config
    }

    /// Cache key of `param` on this device.
    pub fn key(&self, param: &str) -> String {
        format!("{}/{}", self.name.to_lowercase(), param)
    }

    fn require_spec(&self, param: &str) -> AppResult<&ParamSpec> {
        self.spec(param).ok_or_else(|| {
            IcsError::usage(self.name.as_str(), format!("device has no parameter '{}'", param))
        })
    }

    // =========================================================================
    // Initialisation
    // =========================================================================

    fn check_config(&self) -> AppResult<BTreeMap<String, Value>> {
        let mut checked = BTreeMap::new();
        for (param, value) in &self.config {
            let spec = self.spec(param).ok_or_else(|| {
                IcsError::config(self.name.as_str(), format!("unknown parameter '{}'", param))
            })?;
            if spec.internal {
                return Err(IcsError::config(
                    self.name.as_str(),
                    format!("parameter '{}' cannot be configured", param),
                ));
            }
            let value = spec.kind.validate(value).map_err(|msg| {
                IcsError::config(
                    self.name.as_str(),
                    format!("{} is an invalid value for parameter '{}': {}", value, param, msg),
                )
            })?;
            checked.insert(param.clone(), value);
        }
        Ok(checked)
    }

    async fn cached(&self, param: &str) -> Option<Value> {
        let cache = self.ctx.cache()?;
        match cache.get(&self.key(param), 0.0).await {
            Ok(entry) => entry.map(|e| e.value),
            Err(err) => {
                warn!(device = %self.name, %param, error = %err, "cache read failed during init");
                None
            }
        }
    }

    /// Initial value for a parameter absent from the cache.
    async fn init_value(&self, spec: &ParamSpec, configured: Option<Value>) -> AppResult<Value> {
        if self.mode() != Mode::Simulation {
            if let Some(reader) = self.readers.get(&spec.name) {
                match reader().await {
                    Ok(value) => return spec.check(&self.name, &value),
                    Err(err) => warn!(
                        device = %self.name,
                        param = %spec.name,
                        error = %err,
                        "could not read initial value from device"
                    ),
                }
            }
        }
        Ok(configured.unwrap_or_else(|| spec.default.clone()))
    }

    /// Resolve every parameter, subscribe to updates and record the
    /// configuration. Must be called once before the device is used.
    pub async fn init(&self) -> AppResult<()> {
        let config = self.check_config()?;
        let now = self.ctx.now();
        let lastconfig = self
            .cached_key(&format!("{}/{}", LASTCONFIG_PREFIX, self.name.to_lowercase()))
            .await
            .and_then(|v| v.as_object().cloned());

        let mut not_cached = Vec::new();
        for spec in &self.specs {
            let configured = config.get(&spec.name).cloned();
            let cached = match self.cached(&spec.name).await {
                Some(value) => match spec.kind.validate(&value) {
                    Ok(value) => Some(value),
                    Err(msg) => {
                        warn!(device = %self.name, param = %spec.name, %msg, "ignoring invalid cached value");
                        None
                    }
                },
                None => None,
            };

            let (value, write_back) = match (cached, configured) {
                (None, None) if spec.mandatory => {
                    return Err(IcsError::config(
                        self.name.as_str(),
                        format!("missing configuration parameter '{}'", spec.name),
                    ));
                }
                (Some(cached), Some(configured)) if cached != configured => {
                    let changed = lastconfig
                        .as_ref()
                        .and_then(|last| last.get(&spec.name))
                        .is_some_and(|last| *last != configured);
                    if changed {
                        warn!(
                            device = %self.name, param = %spec.name, %configured,
                            "value changed in setup, using new configured value"
                        );
                        (configured, true)
                    } else if spec.prefers_cache() {
                        warn!(
                            device = %self.name, param = %spec.name, %cached, %configured,
                            "cached value differs from setup, using cached value"
                        );
                        (cached, true)
                    } else {
                        warn!(
                            device = %self.name, param = %spec.name, %cached, %configured,
                            "cached value differs from setup, using configured value"
                        );
                        (configured, true)
                    }
                }
                (Some(cached), _) => (cached, false),
                (None, configured) => {
                    not_cached.push(spec.name.clone());
                    (self.init_value(spec, configured).await?, true)
                }
            };

            if write_back {
                self.cache_put(&spec.name, value.clone(), now, None).await;
            }
            self.params.write().insert(
                spec.name.clone(),
                Slot {
                    value: value.clone(),
                    time: now,
                },
            );
            if let Some(hook) = self.hooks.get(&spec.name) {
                hook(&value);
            }
        }
        if !not_cached.is_empty() && self.ctx.cache().is_some() {
            info!(device = %self.name, params = %not_cached.join(", "), "parameters were not present in cache");
        }

        self.subscribe().await;

        if self.ctx.cache().is_some() {
            let record: Map<String, Value> = config.into_iter().collect();
            self.cache_put_key(
                &format!("{}/{}", LASTCONFIG_PREFIX, self.name.to_lowercase()),
                Value::Object(record),
                now,
                None,
            )
            .await;
        }

        if self.mode() == Mode::Simulation {
            if let Some(value) = self.cached("value").await {
                self.sim.lock().track(value);
            }
        }
        debug!(device = %self.name, class = %self.class, "device initialized");
        Ok(())
    }

    async fn cached_key(&self, key: &str) -> Option<Value> {
        let cache = self.ctx.cache()?;
        cache.get_value(key, 0.0).await.ok().flatten()
    }

    /// Subscribe update hooks and local value tracking to the cache.
    async fn subscribe(&self) {
        let Some(cache) = self.ctx.cache() else {
            return;
        };
        let mut ids = Vec::new();
        for spec in &self.specs {
            let params = Arc::clone(&self.params);
            let hook = self.hooks.get(&spec.name).cloned();
            let name = spec.name.clone();
            let callback = Arc::new(move |entry: &CacheEntry| {
                if entry.expired {
                    return;
                }
                let changed = {
                    let mut params = params.write();
                    match params.get(&name) {
                        Some(slot) if slot.time > entry.time => false,
                        Some(slot) if slot.value == entry.value => {
                            params.insert(name.clone(), Slot { value: entry.value.clone(), time: entry.time });
                            false
                        }
                        _ => {
                            params.insert(name.clone(), Slot { value: entry.value.clone(), time: entry.time });
                            true
                        }
                    }
                };
                if changed {
                    if let Some(hook) = &hook {
                        hook(&entry.value);
                    }
                }
            });
            match cache.add_callback(&self.key(&spec.name), callback).await {
                Ok(id) => ids.push(id),
                Err(err) => warn!(device = %self.name, param = %spec.name, error = %err, "subscription failed"),
            }
        }
        self.subscriptions.lock().extend(ids);
    }

    /// Drop cache subscriptions.
    pub async fn shutdown(&self) {
        let ids: Vec<CallbackId> = self.subscriptions.lock().drain(..).collect();
        if let Some(cache) = self.ctx.cache() {
            for id in ids {
                if let Err(err) = cache.remove_callback(id).await {
                    debug!(device = %self.name, error = %err, "removing subscription failed");
                }
            }
        }
    }

    // =========================================================================
    // Cache helpers
    // =========================================================================

    /// Write `param` to the cache; failures are logged, not raised.
    pub async fn cache_put(&self, param: &str, value: Value, time: f64, ttl: Option<f64>) {
        self.cache_put_key(&self.key(param), value, time, ttl).await;
    }

    async fn cache_put_key(&self, key: &str, value: Value, time: f64, ttl: Option<f64>) {
        if let Some(cache) = self.ctx.cache() {
            if let Err(err) = cache.put(key, value, time, ttl).await {
                warn!(device = %self.name, %key, error = %err, "cache write failed");
            }
        }
    }

    /// Cached entry of `param`, if younger than `maxage` seconds.
    pub async fn cache_get(&self, param: &str, maxage: Option<f64>) -> Option<CacheEntry> {
        let cache = self.ctx.cache()?;
        let mintime = maxage.map_or(0.0, |age| self.ctx.now() - age);
        match cache.get(&self.key(param), mintime).await {
            Ok(entry) => entry,
            Err(err) => {
                debug!(device = %self.name, %param, error = %err, "cache read failed");
                None
            }
        }
    }

    pub async fn cache_invalidate(&self, param: &str) {
        if let Some(cache) = self.ctx.cache() {
            if let Err(err) = cache.invalidate(&self.key(param)).await {
                debug!(device = %self.name, %param, error = %err, "cache invalidate failed");
            }
        }
    }

    // =========================================================================
    // Parameter access
    // =========================================================================

    /// In-process value of `param`.
    pub fn local(&self, param: &str) -> Option<Value> {
        self.params.read().get(param).map(|slot| slot.value.clone())
    }

    /// Local numeric value of `param`.
    pub fn float(&self, param: &str) -> Option<f64> {
        self.local(param).and_then(|v| v.as_f64())
    }

    pub fn maxage(&self) -> Option<f64> {
        MAXAGE.local(self).flatten()
    }

    pub fn fmtstr(&self) -> String {
        FMTSTR.local(self).unwrap_or_else(|| "%s".to_string())
    }

    /// Format a value of this device with its `fmtstr`.
    pub fn format(&self, value: &Value) -> String {
        format_value(&self.fmtstr(), value)
    }

    /// Parameter GET.
    pub async fn param(&self, param: &str) -> AppResult<Value> {
        let spec = self.require_spec(param)?;
        if spec.volatile {
            if let Some(reader) = self.readers.get(param) {
                if self.mode() == Mode::Simulation {
                    return self
                        .local(param)
                        .ok_or_else(|| IcsError::usage(self.name.as_str(), format!("parameter '{}' not initialized", param)));
                }
                let value = spec.check(&self.name, &reader().await.map_err(|e| e.with_device(&self.name))?)?;
                // compare with the cache itself; the local mirror may lag behind it
                let last = match self.ctx.cache() {
                    Some(_) => self.cache_get(param, None).await.map(|entry| entry.value),
                    None => self.local(param),
                };
                if last.as_ref() != Some(&value) {
                    let now = self.ctx.now();
                    self.cache_put(param, value.clone(), now, None).await;
                    self.params.write().insert(
                        param.to_string(),
                        Slot {
                            value: value.clone(),
                            time: now,
                        },
                    );
                }
                return Ok(value);
            }
        }

        let local = self.params.read().get(param).cloned();
        if self.mode() != Mode::Simulation {
            if let Some(entry) = self.cache_get(param, None).await {
                let fresher = local.as_ref().map_or(true, |slot| entry.time >= slot.time);
                if fresher {
                    self.params.write().insert(
                        param.to_string(),
                        Slot {
                            value: entry.value.clone(),
                            time: entry.time,
                        },
                    );
                    return Ok(entry.value);
                }
            }
        }
        local.map(|slot| slot.value).ok_or_else(|| {
            IcsError::usage(self.name.as_str(), format!("parameter '{}' not initialized", param))
        })
    }

    /// Parameter SET.
    pub async fn set_param(&self, param: &str, value: Value) -> AppResult<()> {
        let spec = self.require_spec(param)?;
        if !spec.settable {
            return Err(IcsError::config(
                self.name.as_str(),
                format!("the {} parameter can only be changed in the setup", param),
            ));
        }
        let value = spec.check(&self.name, &value)?;
        match self.mode() {
            Mode::Slave => {
                return Err(IcsError::mode(
                    self.name.as_str(),
                    format!("setting parameter {} not possible in slave mode", param),
                ))
            }
            Mode::Simulation => {
                self.store_local(param, value);
                return Ok(());
            }
            Mode::Master | Mode::Maintenance => {}
        }
        if let Some(writer) = self.writers.get(param) {
            writer(value.clone()).await.map_err(|e| e.with_device(&self.name))?;
        }
        let old = self.local(param);
        let now = self.ctx.now();
        self.params.write().insert(
            param.to_string(),
            Slot {
                value: value.clone(),
                time: now,
            },
        );
        if let Some(hook) = self.hooks.get(param) {
            hook(&value);
        }
        info!(device = %self.name, %param, new = %value, old = ?old, "parameter set");
        self.cache_put(param, value, now, self.maxage()).await;
        Ok(())
    }

    fn store_local(&self, param: &str, value: Value) {
        let now = self.ctx.now();
        if let Some(hook) = self.hooks.get(param) {
            hook(&value);
        }
        self.params
            .write()
            .insert(param.to_string(), Slot { value, time: now });
    }

    /// Update a parameter the device manages itself (`target`, `fixed`, ...).
    /// Bypasses the settable flag and the mode check; in simulation the cache
    /// is left alone.
    pub async fn set_internal(&self, param: &str, value: Value) -> AppResult<()> {
        let spec = self.require_spec(param)?;
        let value = spec.check(&self.name, &value)?;
        if self.mode() == Mode::Simulation {
            self.store_local(param, value);
            return Ok(());
        }
        let now = self.ctx.now();
        self.params.write().insert(
            param.to_string(),
            Slot {
                value: value.clone(),
                time: now,
            },
        );
        self.cache_put(param, value, now, None).await;
        Ok(())
    }

    /// History of `param` between `from` and `to`. Negative times count hours
    /// back from now; `None` means the beginning or now.
    pub async fn history(&self, param: &str, from: Option<f64>, to: Option<f64>) -> AppResult<Vec<(f64, Value)>> {
        let cache = self
            .ctx
            .cache()
            .ok_or_else(|| IcsError::usage(self.name.as_str(), "no cache available for history"))?;
        let now = self.ctx.now();
        let resolve = |t: f64| if t < 0.0 { now + t * 3600.0 } else { t };
        let from = from.map_or(0.0, resolve);
        let to = to.map_or(now, resolve);
        let entries = cache.history(&self.key(param), from, to).await?;
        Ok(entries.into_iter().map(|e| (e.time, e.value)).collect())
    }

    /// Run `f` under this device's advisory cache lock.
    pub async fn with_device_lock<F, Fut, T>(&self, timeout: f64, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = AppResult<T>> + Send,
        T: Send,
    {
        match self.ctx.cache() {
            Some(cache) => crate::cache::with_lock(cache.as_ref(), &self.name.to_lowercase(), timeout, f).await,
            None => f().await,
        }
    }

    // =========================================================================
    // Simulation
    // =========================================================================

    pub fn sim_state(&self) -> SimState {
        self.sim.lock().clone()
    }

    pub fn sim_value(&self) -> Option<Value> {
        self.sim.lock().value.clone()
    }

    pub fn sim_set(&self, value: Value) {
        self.sim.lock().track(value);
    }

    /// Record the start of a simulated movement at virtual time `at`.
    pub fn sim_start(&self, target: Value, at: f64) {
        let mut sim = self.sim.lock();
        sim.track(target);
        sim.started = Some(at);
    }
}
