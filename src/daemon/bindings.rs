//! Rhai bindings for daemon scripts.
//!
//! Scripts address devices by name and call plain functions:
//!
//! ```rhai
//! start("m1", 5.0);
//! let reached = wait("m1");
//! let counts = count("det", 1.0);
//! print(`m1 at ${reached}, ${counts} counts`);
//! ```
//!
//! # Architecture
//!
//! ```text
//! spawn_blocking thread                     tokio runtime
//! ┌──────────────────────┐   block_on     ┌──────────────────────┐
//! │ Engine::run          │ ─────────────► │ Readable / Moveable  │
//! │  └─ registered fns   │ ◄───────────── │ Measurable / core    │
//! └──────────────────────┘   AppResult    └──────────────────────┘
//! ```
//!
//! Every device call goes through [`Context::checkpoint`] (inside the device
//! traits) and the engine additionally checks it every few hundred
//! operations, so pure-computation loops can be paused and stopped too.

use crate::context::Context;
use crate::daemon::auth::AccessLevel;
use crate::device::{measurable, moveable, readable, Device};
use crate::error::{AppResult, IcsError};
use rhai::{Dynamic, Engine, EvalAltResult, ImmutableString, Position, Scope};
use serde_json::{Map, Number, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Operations between two breakpoint checks in pure script code.
const CHECKPOINT_EVERY: u64 = 256;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: f64 = 0.1;

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Script functions with a one-line description, for `help`.
pub const FUNCTIONS: &[(&str, &str)] = &[
    ("read(dev)", "current value of a device"),
    ("status(dev)", "current status of a device"),
    ("start(dev, target)", "start moving a device"),
    ("wait(dev)", "wait until a device stops moving; returns its value"),
    ("maw(dev, target)", "move and wait"),
    ("stop(dev)", "stop a moving device"),
    ("fix(dev, reason)", "prevent a device from moving"),
    ("release(dev)", "allow a fixed device to move again"),
    ("count(dev, preset)", "acquire for preset seconds"),
    ("get_param(dev, param)", "value of a device parameter"),
    ("set_param(dev, param, value)", "change a device parameter"),
    ("sleep(seconds)", "wait, interruptible by pause and stop"),
    ("now()", "current time in seconds"),
    ("mode()", "execution mode of the session"),
];

/// Help for one script function, or the list of all of them.
pub fn help_text(topic: Option<&str>) -> String {
    match topic.filter(|t| !t.is_empty()) {
        Some(topic) => FUNCTIONS
            .iter()
            .find(|(sig, _)| sig.split('(').next() == Some(topic))
            .map(|(sig, text)| format!("{}: {}", sig, text))
            .unwrap_or_else(|| format!("no help for '{}'", topic)),
        None => FUNCTIONS
            .iter()
            .map(|(sig, text)| format!("{:<30} {}", sig, text))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Output of a running script.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Message { level: String, text: String },
    /// An acquisition is about to start.
    LiveParams { device: String, preset: f64 },
    /// An acquisition finished.
    LiveData { device: String, value: Value },
}

pub type EventSink = Arc<dyn Fn(HostEvent) + Send + Sync>;

/// A Rhai engine bound to one [`Context`].
pub struct ScriptHost {
    engine: Engine,
}

impl ScriptHost {
    /// `runtime` must not be the runtime of the calling thread: scripts run on
    /// a blocking thread and drive device futures through it.
    pub fn new(ctx: Arc<Context>, runtime: Handle, sink: EventSink) -> Self {
        let mut engine = Engine::new();

        let progress_ctx = Arc::clone(&ctx);
        engine.on_progress(move |ops| {
            if ops % CHECKPOINT_EVERY != 0 {
                return None;
            }
            progress_ctx.checkpoint().err().map(Dynamic::from)
        });

        let print_sink = Arc::clone(&sink);
        engine.on_print(move |text| {
            print_sink(HostEvent::Message {
                level: "info".into(),
                text: text.to_string(),
            })
        });
        let debug_sink = Arc::clone(&sink);
        engine.on_debug(move |text, _source, _pos| {
            debug_sink(HostEvent::Message {
                level: "debug".into(),
                text: text.to_string(),
            })
        });

        register_devices(&mut engine, &ctx, &runtime, &sink);
        Self { engine }
    }

    /// Run `code` to completion on the current (blocking) thread.
    pub fn run(&self, code: &str) -> AppResult<()> {
        let mut scope = Scope::new();
        self.engine
            .run_with_scope(&mut scope, code)
            .map_err(from_rhai)
    }

    /// Compile `code` without running it.
    pub fn validate(&self, code: &str) -> AppResult<()> {
        self.engine
            .compile(code)
            .map(|_| ())
            .map_err(|err| IcsError::Script(err.to_string()))
    }
}

// =============================================================================
// Device functions
// =============================================================================

fn register_devices(engine: &mut Engine, ctx: &Arc<Context>, rt: &Handle, sink: &EventSink) {
    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn("read", move |name: ImmutableString| -> RhaiResult<Dynamic> {
        let dev = resolve(&c, &h, &name)?;
        let value = call(&h, readable(&*dev).map_err(to_rhai)?.read(None))?;
        Ok(to_dynamic(&value))
    });

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn("status", move |name: ImmutableString| -> RhaiResult<String> {
        let dev = resolve(&c, &h, &name)?;
        let status = call(&h, readable(&*dev).map_err(to_rhai)?.status(None))?;
        Ok(status.to_string())
    });

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn(
        "start",
        move |name: ImmutableString, target: Dynamic| -> RhaiResult<()> {
            c.require(AccessLevel::User, Some(name.as_str()), "move").map_err(to_rhai)?;
            let dev = resolve(&c, &h, &name)?;
            let target = from_dynamic(target);
            call(&h, moveable(&*dev).map_err(to_rhai)?.start(target))
        },
    );

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn("wait", move |name: ImmutableString| -> RhaiResult<Dynamic> {
        let dev = resolve(&c, &h, &name)?;
        let value = call(&h, moveable(&*dev).map_err(to_rhai)?.wait())?;
        Ok(to_dynamic(&value))
    });

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn(
        "maw",
        move |name: ImmutableString, target: Dynamic| -> RhaiResult<Dynamic> {
            c.require(AccessLevel::User, Some(name.as_str()), "move").map_err(to_rhai)?;
            let dev = resolve(&c, &h, &name)?;
            let target = from_dynamic(target);
            let value = call(&h, moveable(&*dev).map_err(to_rhai)?.maw(target))?;
            Ok(to_dynamic(&value))
        },
    );

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn("stop", move |name: ImmutableString| -> RhaiResult<()> {
        let dev = resolve(&c, &h, &name)?;
        call(&h, moveable(&*dev).map_err(to_rhai)?.stop())
    });

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn(
        "fix",
        move |name: ImmutableString, reason: ImmutableString| -> RhaiResult<()> {
            c.require(AccessLevel::User, Some(name.as_str()), "fix").map_err(to_rhai)?;
            let dev = resolve(&c, &h, &name)?;
            call(&h, moveable(&*dev).map_err(to_rhai)?.fix(&reason))
        },
    );

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn("release", move |name: ImmutableString| -> RhaiResult<()> {
        c.require(AccessLevel::User, Some(name.as_str()), "release").map_err(to_rhai)?;
        let dev = resolve(&c, &h, &name)?;
        call(&h, moveable(&*dev).map_err(to_rhai)?.release())
    });

    let (c, h, s) = (Arc::clone(ctx), rt.clone(), Arc::clone(sink));
    engine.register_fn(
        "count",
        move |name: ImmutableString, preset: Dynamic| -> RhaiResult<Dynamic> {
            c.require(AccessLevel::User, Some(name.as_str()), "count").map_err(to_rhai)?;
            let preset = number(&preset)?;
            let dev = resolve(&c, &h, &name)?;
            s(HostEvent::LiveParams {
                device: dev.name().to_string(),
                preset,
            });
            let value = call(&h, measurable(&*dev).map_err(to_rhai)?.count(preset))?;
            s(HostEvent::LiveData {
                device: dev.name().to_string(),
                value: value.clone(),
            });
            Ok(to_dynamic(&value))
        },
    );

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn(
        "get_param",
        move |name: ImmutableString, param: ImmutableString| -> RhaiResult<Dynamic> {
            let dev = resolve(&c, &h, &name)?;
            let value = call(&h, dev.core().param(&param))?;
            Ok(to_dynamic(&value))
        },
    );

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn(
        "set_param",
        move |name: ImmutableString, param: ImmutableString, value: Dynamic| -> RhaiResult<()> {
            c.require(AccessLevel::User, Some(name.as_str()), "setting parameters").map_err(to_rhai)?;
            let dev = resolve(&c, &h, &name)?;
            call(&h, dev.core().set_param(&param, from_dynamic(value)))
        },
    );

    let (c, h) = (Arc::clone(ctx), rt.clone());
    engine.register_fn("sleep", move |seconds: Dynamic| -> RhaiResult<()> {
        let mut remaining = number(&seconds)?;
        while remaining > 0.0 {
            c.checkpoint().map_err(to_rhai)?;
            let slice = remaining.min(SLEEP_SLICE);
            h.block_on(c.clock().sleep(slice));
            remaining -= slice;
        }
        Ok(())
    });

    let c = Arc::clone(ctx);
    engine.register_fn("now", move || c.now());

    let c = Arc::clone(ctx);
    engine.register_fn("mode", move || c.mode().to_string());
}

/// Existing device, or one created from the setups on first use.
fn resolve(ctx: &Arc<Context>, rt: &Handle, name: &str) -> RhaiResult<Arc<dyn Device>> {
    match ctx.device(name) {
        Some(device) => Ok(device),
        None => rt.block_on(ctx.create_device(name)).map_err(to_rhai),
    }
}

fn call<T>(rt: &Handle, fut: impl Future<Output = AppResult<T>>) -> RhaiResult<T> {
    rt.block_on(fut).map_err(to_rhai)
}

fn number(value: &Dynamic) -> RhaiResult<f64> {
    if let Ok(f) = value.as_float() {
        return Ok(f);
    }
    if let Ok(i) = value.as_int() {
        return Ok(i as f64);
    }
    Err(to_rhai(IcsError::Script(format!(
        "expected a number, got {}",
        value.type_name()
    ))))
}

// =============================================================================
// Conversions
// =============================================================================

fn to_rhai(err: IcsError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(Dynamic::from(err), Position::NONE))
}

/// Recover the [`IcsError`] a script failed with.
pub fn from_rhai(err: Box<EvalAltResult>) -> IcsError {
    match *err {
        EvalAltResult::ErrorRuntime(value, pos) => match value.try_cast::<IcsError>() {
            Some(err) => err,
            None => IcsError::Script(format!("runtime error at {}", pos)),
        },
        EvalAltResult::ErrorTerminated(token, _) => match token.try_cast::<IcsError>() {
            Some(err) => err,
            None => IcsError::Aborted("script terminated".into()),
        },
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => from_rhai(inner),
        other => IcsError::Script(other.to_string()),
    }
}

pub fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Dynamic::from(i),
            None => Dynamic::from(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic).collect()),
        Value::Object(map) => Dynamic::from_map(
            map.iter()
                .map(|(k, v)| (k.as_str().into(), to_dynamic(v)))
                .collect(),
        ),
    }
}

pub fn from_dynamic(value: Dynamic) -> Value {
    if value.is_unit() {
        return Value::Null;
    }
    if let Ok(b) = value.as_bool() {
        return Value::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return Value::from(i);
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f).map_or(Value::Null, Value::Number);
    }
    if value.is_string() {
        return Value::String(value.into_string().unwrap_or_default());
    }
    if value.is_array() {
        if let Some(items) = value.clone().try_cast::<rhai::Array>() {
            return Value::Array(items.into_iter().map(from_dynamic).collect());
        }
    }
    if value.is_map() {
        if let Some(map) = value.clone().try_cast::<rhai::Map>() {
            let object: Map<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k.to_string(), from_dynamic(v)))
                .collect();
            return Value::Object(object);
        }
    }
    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, Settings};
    use crate::context::Mode;
    use parking_lot::Mutex;
    use serde_json::json;

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<HostEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&events);
        (Arc::new(move |e: HostEvent| captured.lock().push(e)), events)
    }

    async fn motor_context() -> Arc<Context> {
        let ctx = Context::builder(Arc::new(Settings::default())).build();
        let config = DeviceConfig::new("virtual_motor")
            .with("abslimits", json!([-100.0, 100.0]))
            .with("speed", 0.0);
        ctx.create_device_from("m1", &config).await.unwrap();
        ctx
    }

    #[test]
    fn test_value_conversion() {
        let value = json!({"a": [1, 2.5, "x", true, null]});
        assert_eq!(from_dynamic(to_dynamic(&value)), value);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_moves_motor() {
        let ctx = motor_context().await;
        let (sink, events) = collecting_sink();
        let host = ScriptHost::new(Arc::clone(&ctx), Handle::current(), sink);
        tokio::task::spawn_blocking(move || host.run(r#"maw("m1", 5); print(`at ${read("m1")}`);"#))
            .await
            .unwrap()
            .unwrap();
        let events = events.lock();
        assert!(matches!(&events[0], HostEvent::Message { text, .. } if text == "at 5.0"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_device_error_is_preserved() {
        let ctx = motor_context().await;
        let (sink, _) = collecting_sink();
        let host = ScriptHost::new(Arc::clone(&ctx), Handle::current(), sink);
        let err = tokio::task::spawn_blocking(move || host.run(r#"start("m1", 500.0);"#))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, IcsError::Limit { .. }), "{err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_cannot_move() {
        let ctx = motor_context().await;
        ctx.set_access_level(AccessLevel::Guest);
        let (sink, _) = collecting_sink();
        let host = ScriptHost::new(Arc::clone(&ctx), Handle::current(), sink);
        let err = tokio::task::spawn_blocking(move || host.run(r#"start("m1", 1.0);"#))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, IcsError::Access { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_breakpoint_stops_busy_loop() {
        let ctx = Context::builder(Arc::new(Settings::default()))
            .mode(Mode::Master)
            .build();
        ctx.set_breakpoint(Some(Arc::new(|| Err(IcsError::Aborted("stop requested".into())))));
        let (sink, _) = collecting_sink();
        let host = ScriptHost::new(Arc::clone(&ctx), Handle::current(), sink);
        let err = tokio::task::spawn_blocking(move || host.run("let x = 0; loop { x += 1; }"))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, IcsError::Aborted(_)));
    }

    #[test]
    fn test_validate_reports_syntax_errors() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = Context::builder(Arc::new(Settings::default())).build();
        let host = ScriptHost::new(ctx, rt.handle().clone(), Arc::new(|_: HostEvent| {}));
        assert!(host.validate("let x = ;").is_err());
        assert!(host.validate("let x = 1;").is_ok());
    }
}
