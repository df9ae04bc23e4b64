//! Device capability traits.
//!
//! A device class implements [`Device`] plus whichever of [`Readable`],
//! [`Moveable`] and [`Measurable`] it supports, providing only the `do_*`
//! hardware methods. The public operations (`read`, `start`, `wait`, ...) are
//! default methods carrying the shared semantics: cache staleness, mode
//! checks, access control and the simulation path.
//!
//! Dynamic callers (poller, script bindings) hold `Arc<dyn Device>` and ask for
//! a capability with `as_readable()` and friends.

use super::core::DeviceCore;
use super::param::ParamType;
use super::status::{Status, StatusCode};
use crate::context::Mode;
use crate::daemon::auth::AccessLevel;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Status polling period while waiting for a movement to finish.
const WAIT_POLL_INTERVAL: f64 = 0.1;

#[async_trait]
pub trait Device: Send + Sync {
    fn core(&self) -> &DeviceCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        None
    }

    fn as_moveable(&self) -> Option<&dyn Moveable> {
        None
    }

    fn as_measurable(&self) -> Option<&dyn Measurable> {
        None
    }

    async fn shutdown(&self) {
        self.core().shutdown().await;
    }
}

/// Capability lookup that fails with a usage error naming the device.
pub fn readable(device: &dyn Device) -> AppResult<&dyn Readable> {
    device
        .as_readable()
        .ok_or_else(|| IcsError::usage(device.name(), "device is not readable"))
}

pub fn moveable(device: &dyn Device) -> AppResult<&dyn Moveable> {
    device
        .as_moveable()
        .ok_or_else(|| IcsError::usage(device.name(), "device cannot be moved"))
}

pub fn measurable(device: &dyn Device) -> AppResult<&dyn Measurable> {
    device
        .as_measurable()
        .ok_or_else(|| IcsError::usage(device.name(), "device cannot count"))
}

/// Main value in simulation: the simulated value, else the last cached one,
/// else the target.
fn sim_value(core: &DeviceCore) -> AppResult<Value> {
    if let Some(value) = core.sim_value() {
        return Ok(value);
    }
    if let Some(target) = core.local("target").filter(|t| !t.is_null()) {
        core.sim_set(target.clone());
        return Ok(target);
    }
    Err(IcsError::mode(core.name(), "no simulated value available"))
}

#[async_trait]
pub trait Readable: Device {
    /// Read the main value from hardware.
    async fn do_read(&self, maxage: Option<f64>) -> AppResult<Value>;

    async fn do_status(&self, _maxage: Option<f64>) -> AppResult<Status> {
        Ok(Status::ok(""))
    }

    /// Combined status and value sample, if the hardware offers one.
    async fn do_poll(&self, _n: u64, _maxage: Option<f64>) -> AppResult<Option<(Status, Value)>> {
        Ok(None)
    }

    /// Main value. A cached value younger than `maxage` is returned as is
    /// (`None` accepts any live cached value, `Some(0.0)` forces a hardware
    /// read); otherwise hardware is read and the cache updated with
    /// TTL = `maxage` parameter.
    async fn read(&self, maxage: Option<f64>) -> AppResult<Value> {
        let core = self.core();
        if core.mode() == Mode::Simulation {
            return sim_value(core);
        }
        if maxage != Some(0.0) {
            if let Some(entry) = core.cache_get("value", maxage).await {
                return Ok(entry.value);
            }
        }
        let value = self
            .do_read(maxage)
            .await
            .map_err(|e| e.with_device(core.name()))?;
        core.cache_put("value", value.clone(), core.ctx().now(), core.maxage())
            .await;
        Ok(value)
    }

    async fn status(&self, maxage: Option<f64>) -> AppResult<Status> {
        let core = self.core();
        if core.mode() == Mode::Simulation {
            return Ok(Status::ok("simulated"));
        }
        if maxage != Some(0.0) {
            if let Some(entry) = core.cache_get("status", maxage).await {
                if let Ok(status) = entry.decode::<Status>() {
                    return Ok(status);
                }
            }
        }
        let status = self
            .do_status(maxage)
            .await
            .map_err(|e| e.with_device(core.name()))?;
        core.cache_put("status", json!(status), core.ctx().now(), core.maxage())
            .await;
        Ok(status)
    }

    /// Fresh `(status, value)` sample for the poller; `n` counts poll cycles.
    async fn poll(&self, n: u64, maxage: Option<f64>) -> AppResult<(Status, Value)> {
        let core = self.core();
        if core.mode() == Mode::Simulation {
            return Ok((self.status(maxage).await?, self.read(maxage).await?));
        }
        if let Some((status, value)) = self
            .do_poll(n, maxage)
            .await
            .map_err(|e| e.with_device(core.name()))?
        {
            let now = core.ctx().now();
            core.cache_put("status", json!(status), now, core.maxage()).await;
            core.cache_put("value", value.clone(), now, core.maxage()).await;
            return Ok((status, value));
        }
        let maxage = Some(maxage.unwrap_or(0.0));
        Ok((self.status(maxage).await?, self.read(maxage).await?))
    }

    /// Value formatted with the device `fmtstr` and unit.
    fn format_value(&self, value: &Value) -> String {
        let core = self.core();
        let unit = core
            .local("unit")
            .and_then(|u| u.as_str().map(str::to_string))
            .unwrap_or_default();
        let text = core.format(value);
        if unit.is_empty() {
            text
        } else {
            format!("{} {}", text, unit)
        }
    }
}

#[async_trait]
pub trait Moveable: Readable {
    async fn do_start(&self, target: Value) -> AppResult<()>;

    async fn do_stop(&self) -> AppResult<()> {
        Ok(())
    }

    /// Device-specific target checks beyond the value type (limits etc.).
    fn do_is_allowed(&self, _target: &Value) -> AppResult<()> {
        Ok(())
    }

    /// Type of the main value, used to validate targets.
    fn value_type(&self) -> ParamType {
        ParamType::float()
    }

    /// Estimated duration of a move, used by simulation. Defaults to
    /// distance / `speed`, or distance / `ramp` (per minute).
    fn estimate_time(&self, from: &Value, to: &Value) -> f64 {
        let core = self.core();
        let (Some(from), Some(to)) = (from.as_f64(), to.as_f64()) else {
            return 0.0;
        };
        let distance = (to - from).abs();
        if let Some(speed) = core.float("speed").filter(|s| *s > 0.0) {
            distance / speed
        } else if let Some(ramp) = core.float("ramp").filter(|r| *r > 0.0) {
            distance / ramp * 60.0
        } else {
            0.0
        }
    }

    /// Validate a target and return it normalised.
    fn check_target(&self, target: &Value) -> AppResult<Value> {
        let name = self.name();
        let target = self
            .value_type()
            .validate(target)
            .map_err(|msg| IcsError::invalid(name, format!("invalid target: {}", msg)))?;
        self.do_is_allowed(&target).map_err(|e| e.with_device(name))?;
        Ok(target)
    }

    /// Start moving to `target` without waiting.
    async fn start(&self, target: Value) -> AppResult<()> {
        let core = self.core();
        let ctx = core.ctx();
        if core.mode() == Mode::Slave {
            return Err(IcsError::mode(core.name(), "start not possible in slave mode"));
        }
        let fixed = core
            .local("fixed")
            .and_then(|f| f.as_str().map(str::to_string))
            .unwrap_or_default();
        if !fixed.is_empty() {
            tracing::warn!(device = %core.name(), reason = %fixed, "device fixed; not moving");
            return Ok(());
        }
        if let Some(level) = core.local("requires").as_ref().and_then(AccessLevel::from_value) {
            ctx.require(level, Some(core.name()), "start")?;
        }
        let target = self.check_target(&target)?;
        core.set_internal("target", target.clone()).await?;
        if core.mode() == Mode::Simulation {
            core.sim_start(target, ctx.now());
            return Ok(());
        }
        tracing::debug!(device = %core.name(), %target, "starting");
        self.do_start(target)
            .await
            .map_err(|e| e.with_device(core.name()))
    }

    /// Wait until the device is no longer busy; returns the reached value.
    async fn wait(&self) -> AppResult<Value> {
        let core = self.core();
        let ctx = core.ctx();
        ctx.checkpoint()?;
        if core.mode() == Mode::Simulation {
            let sim = core.sim_state();
            if let (Some(old), Some(new), Some(started)) = (&sim.old_value, &sim.value, sim.started) {
                ctx.clock().advance_to(started + self.estimate_time(old, new));
            }
            return sim_value(core);
        }
        let began = ctx.now();
        loop {
            ctx.checkpoint()?;
            let status = self.status(Some(0.0)).await?;
            match status.code {
                StatusCode::Busy => {}
                StatusCode::Error => {
                    return Err(IcsError::position(
                        core.name(),
                        format!("device in error state after move: {}", status.text),
                    ))
                }
                _ => break,
            }
            if let Some(timeout) = core.float("timeout").filter(|t| *t > 0.0) {
                if ctx.now() - began > timeout {
                    return Err(IcsError::timeout(
                        Some(core.name()),
                        format!("movement not finished after {} s", timeout),
                    ));
                }
            }
            ctx.clock().sleep(WAIT_POLL_INTERVAL).await;
        }
        self.read(Some(0.0)).await
    }

    /// Move and wait.
    async fn maw(&self, target: Value) -> AppResult<Value> {
        self.start(target).await?;
        self.wait().await
    }

    async fn stop(&self) -> AppResult<()> {
        let core = self.core();
        if core.mode() == Mode::Simulation {
            return Ok(());
        }
        if core.mode() == Mode::Slave {
            return Err(IcsError::mode(core.name(), "stop not possible in slave mode"));
        }
        self.do_stop().await.map_err(|e| e.with_device(core.name()))
    }

    /// Prevent further movement until [`release`](Moveable::release).
    async fn fix(&self, reason: &str) -> AppResult<()> {
        let reason = if reason.is_empty() { "fixed" } else { reason };
        self.core().set_internal("fixed", json!(reason)).await
    }

    async fn release(&self) -> AppResult<()> {
        self.core().set_internal("fixed", json!("")).await
    }
}

#[async_trait]
pub trait Measurable: Readable {
    /// Acquire for `preset` seconds and return the result.
    async fn do_count(&self, preset: f64) -> AppResult<Value>;

    async fn count(&self, preset: f64) -> AppResult<Value> {
        let core = self.core();
        let ctx = core.ctx();
        if core.mode() == Mode::Slave {
            return Err(IcsError::mode(core.name(), "counting not possible in slave mode"));
        }
        if preset < 0.0 {
            return Err(IcsError::invalid(core.name(), "preset must not be negative"));
        }
        ctx.checkpoint()?;
        if core.mode() == Mode::Simulation {
            ctx.clock().tick(preset);
            let result = json!(preset);
            core.sim_set(result.clone());
            return Ok(result);
        }
        let result = self
            .do_count(preset)
            .await
            .map_err(|e| e.with_device(core.name()))?;
        core.cache_put("value", result.clone(), ctx.now(), core.maxage())
            .await;
        Ok(result)
    }
}
