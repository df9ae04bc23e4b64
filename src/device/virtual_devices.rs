//! In-process emulated hardware.
//!
//! Virtual devices behave like real ones as seen through the device traits:
//! a motor takes time to travel at its `speed`, a sensor returns a noisy
//! reading, a timer blocks for its preset. They back the demo setups, the
//! integration tests and dry runs of scripts written for real instruments.
//!
//! # Architecture
//!
//! ```text
//! VirtualMotor::do_start ──spawn──> motion task (tokio, MOTION_TICK steps)
//!        │                              │
//!        └──── Arc<Mutex<MotorState>> ◄─┘  position, target, speed, moving
//! ```

use super::capabilities::{
    limits_params, offset_params, precision_params, HasLimits, HasOffset, HasPrecision,
};
use super::core::DeviceCore;
use super::param::{merge_specs, moveable_params, readable_params, ParamSpec, ParamType};
use super::status::{Status, StatusCode};
use super::traits::{Device, Measurable, Moveable, Readable};
use crate::config::DeviceConfig;
use crate::context::Context;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Step of the emulated motion.
const MOTION_TICK: Duration = Duration::from_millis(100);

/// Slice in which a virtual timer checks for stop requests.
const COUNT_SLICE: f64 = 0.1;

fn config_f64(config: &DeviceConfig, name: &str) -> Option<f64> {
    config.params.get(name).and_then(Value::as_f64)
}

// =============================================================================
// VirtualMotor
// =============================================================================

#[derive(Debug, Clone, Default)]
struct MotorState {
    /// Raw (hardware) position.
    position: f64,
    target: f64,
    speed: f64,
    moving: bool,
}

pub struct VirtualMotor {
    core: DeviceCore,
    state: Arc<Mutex<MotorState>>,
    motion: Mutex<Option<JoinHandle<()>>>,
}

impl VirtualMotor {
    pub const CLASS: &'static str = "virtual_motor";

    pub fn specs() -> Vec<ParamSpec> {
        let mut specs = merge_specs(moveable_params(), limits_params());
        specs = merge_specs(specs, offset_params());
        specs = merge_specs(specs, precision_params());
        merge_specs(
            specs,
            vec![
                ParamSpec::new("speed", ParamType::float_min(0.0))
                    .description("Virtual speed of the motor, 0 means instantaneous")
                    .default(0.0)
                    .unit("main/s")
                    .settable()
                    .volatile(),
                ParamSpec::new("curvalue", ParamType::float())
                    .description("Initial raw position")
                    .default(0.0),
            ],
        )
    }

    pub async fn create(name: &str, config: &DeviceConfig, ctx: Arc<Context>) -> AppResult<Arc<Self>> {
        let position = config_f64(config, "curvalue").unwrap_or(0.0);
        let state = Arc::new(Mutex::new(MotorState {
            position,
            target: position,
            speed: config_f64(config, "speed").unwrap_or(0.0),
            moving: false,
        }));
        let read_state = Arc::clone(&state);
        let write_state = Arc::clone(&state);
        let device = name.to_string();
        let core = DeviceCore::new(name, Self::CLASS, Self::specs(), config.params.clone(), ctx)
            .reader("speed", move || {
                let speed = read_state.lock().speed;
                async move { Ok::<Value, IcsError>(json!(speed)) }
            })
            .writer("speed", move |value| {
                let state = Arc::clone(&write_state);
                let device = device.clone();
                async move {
                    match value.as_f64() {
                        Some(speed) => {
                            state.lock().speed = speed;
                            Ok(())
                        }
                        None => Err(IcsError::invalid(device, format!("invalid speed {}", value))),
                    }
                }
            });
        core.init().await?;
        Ok(Arc::new(Self {
            core,
            state,
            motion: Mutex::new(None),
        }))
    }

    fn spawn_motion(&self) {
        let state = Arc::clone(&self.state);
        let task = tokio::spawn(async move {
            let tick = MOTION_TICK.as_secs_f64();
            loop {
                tokio::time::sleep(MOTION_TICK).await;
                let mut s = state.lock();
                let delta = s.target - s.position;
                let step = s.speed * tick;
                if s.speed <= 0.0 || delta.abs() <= step {
                    s.position = s.target;
                    s.moving = false;
                    break;
                }
                s.position += step * delta.signum();
            }
        });
        if let Some(previous) = self.motion.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for VirtualMotor {
    fn drop(&mut self) {
        if let Some(task) = self.motion.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Device for VirtualMotor {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_moveable(&self) -> Option<&dyn Moveable> {
        Some(self)
    }
}

#[async_trait]
impl Readable for VirtualMotor {
    async fn do_read(&self, _maxage: Option<f64>) -> AppResult<Value> {
        let raw = self.state.lock().position;
        Ok(json!(self.to_user(raw)))
    }

    async fn do_status(&self, _maxage: Option<f64>) -> AppResult<Status> {
        let s = self.state.lock().clone();
        if s.moving {
            return Ok(Status::busy(format!("moving to {}", self.to_user(s.target))));
        }
        if !self.is_at_target(s.position, s.target) {
            return Ok(Status::new(StatusCode::NotReached, "target not reached"));
        }
        Ok(Status::ok("idle"))
    }
}

#[async_trait]
impl Moveable for VirtualMotor {
    async fn do_start(&self, target: Value) -> AppResult<()> {
        let target = target
            .as_f64()
            .ok_or_else(|| IcsError::invalid(self.name(), "target is not a number"))?;
        let raw = self.to_raw(target);
        let instant = {
            let mut s = self.state.lock();
            s.target = raw;
            if s.speed <= 0.0 {
                s.position = raw;
                s.moving = false;
                true
            } else {
                s.moving = true;
                false
            }
        };
        if !instant {
            self.spawn_motion();
        }
        Ok(())
    }

    async fn do_stop(&self) -> AppResult<()> {
        if let Some(task) = self.motion.lock().take() {
            task.abort();
        }
        let mut s = self.state.lock();
        s.moving = false;
        s.target = s.position;
        Ok(())
    }

    fn do_is_allowed(&self, target: &Value) -> AppResult<()> {
        let value = target
            .as_f64()
            .ok_or_else(|| IcsError::invalid(self.name(), "target is not a number"))?;
        self.check_limits(value)
    }
}

impl HasLimits for VirtualMotor {}
impl HasOffset for VirtualMotor {}
impl HasPrecision for VirtualMotor {}

// =============================================================================
// VirtualSensor
// =============================================================================

/// A readable device returning `center` plus uniform noise of `jitter`.
pub struct VirtualSensor {
    core: DeviceCore,
}

impl VirtualSensor {
    pub const CLASS: &'static str = "virtual_sensor";

    pub fn specs() -> Vec<ParamSpec> {
        merge_specs(
            readable_params(),
            vec![
                ParamSpec::new("center", ParamType::float())
                    .description("Mean value of the reading")
                    .default(0.0)
                    .settable(),
                ParamSpec::new("jitter", ParamType::float_min(0.0))
                    .description("Amplitude of the noise")
                    .default(0.0)
                    .settable(),
            ],
        )
    }

    pub async fn create(name: &str, config: &DeviceConfig, ctx: Arc<Context>) -> AppResult<Arc<Self>> {
        let core = DeviceCore::new(name, Self::CLASS, Self::specs(), config.params.clone(), ctx);
        core.init().await?;
        Ok(Arc::new(Self { core }))
    }
}

#[async_trait]
impl Device for VirtualSensor {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }
}

#[async_trait]
impl Readable for VirtualSensor {
    async fn do_read(&self, _maxage: Option<f64>) -> AppResult<Value> {
        let center = self.core.float("center").unwrap_or(0.0);
        let jitter = self.core.float("jitter").unwrap_or(0.0);
        let noise = if jitter > 0.0 {
            rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            0.0
        };
        Ok(json!(center + noise))
    }
}

// =============================================================================
// VirtualTimer
// =============================================================================

/// A measurable device that counts for the preset time.
pub struct VirtualTimer {
    core: DeviceCore,
    last: Mutex<f64>,
}

impl VirtualTimer {
    pub const CLASS: &'static str = "virtual_timer";

    pub fn specs() -> Vec<ParamSpec> {
        merge_specs(
            readable_params(),
            vec![ParamSpec::new("fmtstr", ParamType::Str)
                .default("%.2f")
                .settable()
                .prefer_cache(false)],
        )
    }

    pub async fn create(name: &str, config: &DeviceConfig, ctx: Arc<Context>) -> AppResult<Arc<Self>> {
        let core = DeviceCore::new(name, Self::CLASS, Self::specs(), config.params.clone(), ctx);
        core.init().await?;
        Ok(Arc::new(Self {
            core,
            last: Mutex::new(0.0),
        }))
    }
}

#[async_trait]
impl Device for VirtualTimer {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn as_readable(&self) -> Option<&dyn Readable> {
        Some(self)
    }

    fn as_measurable(&self) -> Option<&dyn Measurable> {
        Some(self)
    }
}

#[async_trait]
impl Readable for VirtualTimer {
    async fn do_read(&self, _maxage: Option<f64>) -> AppResult<Value> {
        Ok(json!(*self.last.lock()))
    }
}

#[async_trait]
impl Measurable for VirtualTimer {
    async fn do_count(&self, preset: f64) -> AppResult<Value> {
        let ctx = self.core.ctx();
        let mut remaining = preset;
        while remaining > 0.0 {
            ctx.checkpoint()?;
            let slice = remaining.min(COUNT_SLICE);
            ctx.clock().sleep(slice).await;
            remaining -= slice;
        }
        *self.last.lock() = preset;
        Ok(json!(preset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    fn context() -> Arc<Context> {
        Context::builder(Arc::new(Settings::default())).build()
    }

    fn motor_config() -> DeviceConfig {
        DeviceConfig::new(VirtualMotor::CLASS).with("abslimits", json!([-10.0, 10.0]))
    }

    #[tokio::test]
    async fn test_instant_motor_moves() {
        let motor = VirtualMotor::create("m1", &motor_config(), context()).await.unwrap();
        assert_eq!(motor.maw(json!(3.5)).await.unwrap(), json!(3.5));
        assert_eq!(motor.core().local("target"), Some(json!(3.5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_with_speed_is_busy_while_moving() {
        let config = motor_config().with("speed", 1.0);
        let motor = VirtualMotor::create("m1", &config, context()).await.unwrap();
        motor.start(json!(2.0)).await.unwrap();
        assert!(motor.status(Some(0.0)).await.unwrap().is_busy());
        let reached = motor.wait().await.unwrap();
        assert_eq!(reached, json!(2.0));
        assert_eq!(motor.status(Some(0.0)).await.unwrap().code, StatusCode::Ok);
    }

    #[tokio::test]
    async fn test_motor_rejects_target_outside_limits() {
        let motor = VirtualMotor::create("m1", &motor_config(), context()).await.unwrap();
        let err = motor.start(json!(11.0)).await.unwrap_err();
        assert!(matches!(err, IcsError::Limit { .. }));
        motor.set_userlimits(-1.0, 1.0).await.unwrap();
        assert!(matches!(motor.start(json!(2.0)).await, Err(IcsError::Limit { .. })));
        assert!(motor.set_userlimits(-20.0, 1.0).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_abslimits_is_config_error() {
        let config = DeviceConfig::new(VirtualMotor::CLASS);
        let err = VirtualMotor::create("m1", &config, context()).await.err().unwrap();
        assert!(matches!(err, IcsError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_offset_shifts_user_value() {
        let config = motor_config().with("offset", 1.0).with("curvalue", 5.0);
        let motor = VirtualMotor::create("m1", &config, context()).await.unwrap();
        assert_eq!(motor.read(Some(0.0)).await.unwrap(), json!(4.0));
        motor.adjust(0.0).await.unwrap();
        assert_eq!(motor.read(Some(0.0)).await.unwrap(), json!(0.0));
    }

    #[tokio::test]
    async fn test_fixed_motor_does_not_move() {
        let motor = VirtualMotor::create("m1", &motor_config(), context()).await.unwrap();
        motor.fix("maintenance").await.unwrap();
        motor.start(json!(1.0)).await.unwrap();
        assert_eq!(motor.read(Some(0.0)).await.unwrap(), json!(0.0));
        motor.release().await.unwrap();
        motor.maw(json!(1.0)).await.unwrap();
        assert_eq!(motor.read(Some(0.0)).await.unwrap(), json!(1.0));
    }

    #[tokio::test]
    async fn test_speed_param_reads_hardware() {
        let config = motor_config().with("speed", 2.0);
        let motor = VirtualMotor::create("m1", &config, context()).await.unwrap();
        assert_eq!(motor.core().param("speed").await.unwrap(), json!(2.0));
        motor.core().set_param("speed", json!(4.0)).await.unwrap();
        assert_eq!(motor.state.lock().speed, 4.0);
    }

    #[tokio::test]
    async fn test_sensor_noise_stays_within_jitter() {
        let config = DeviceConfig::new(VirtualSensor::CLASS)
            .with("center", 5.0)
            .with("jitter", 0.5);
        let sensor = VirtualSensor::create("t1", &config, context()).await.unwrap();
        for _ in 0..20 {
            let x = sensor.read(Some(0.0)).await.unwrap().as_f64().unwrap();
            assert!((4.5..=5.5).contains(&x));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_counts_preset() {
        let timer = VirtualTimer::create("timer", &DeviceConfig::new(VirtualTimer::CLASS), context())
            .await
            .unwrap();
        assert_eq!(timer.count(1.5).await.unwrap(), json!(1.5));
        assert_eq!(timer.read(Some(0.0)).await.unwrap(), json!(1.5));
        assert!(timer.count(-1.0).await.is_err());
    }
}
