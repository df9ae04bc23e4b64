//! Dry runs of scripts.
//!
//! A simulation gets its own [`Context`] in [`Mode::Simulation`]: a private
//! in-memory cache seeded with a snapshot of the parent's cache, a virtual
//! clock starting at the parent's current time, and fresh instances of the
//! parent's devices. Hardware is never touched; blocking operations advance
//! the virtual clock by their estimated duration instead of sleeping.
//!
//! # Architecture
//!
//! ```text
//! parent ctx ──snapshot──► CacheStore ──► LocalCache ──► sim ctx (virtual clock)
//!                                                           │
//!                              spawn_blocking(ScriptHost::run)
//!                                                           │
//! caller ◄──── SimEvent::Message ... SimEvent::Finished ◄───┘
//! ```

use super::auth::AccessLevel;
use super::bindings::{EventSink, HostEvent, ScriptHost};
use super::protocol::DeviceSummary;
use crate::cache::{Cache, CacheStore, LocalCache};
use crate::clock::Clock;
use crate::config::DeviceConfig;
use crate::context::{Context, Mode};
use crate::error::{AppResult, IcsError};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Prefix of every message produced by a dry run.
pub const SIM_PREFIX: &str = "(sim) ";

/// Outcome of a dry run.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationReport {
    /// Virtual seconds the script would have taken.
    pub elapsed: f64,
    pub devices: Vec<DeviceSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Message {
        time: f64,
        level: String,
        text: String,
    },
    Finished(SimulationReport),
}

/// Build a simulation context from `parent`, acting with `level` rights.
pub async fn fork(parent: &Arc<Context>, level: AccessLevel) -> AppResult<Arc<Context>> {
    let store = match parent.cache() {
        Some(cache) => CacheStore::from_entries(cache.snapshot().await?),
        None => CacheStore::new(),
    };
    let cache: Arc<dyn Cache> = Arc::new(LocalCache::with_id(Arc::new(store), "simulation"));
    let sim = Context::builder(Arc::clone(parent.settings()))
        .cache(cache)
        .mode(Mode::Simulation)
        .clock(Clock::virtual_at(parent.now()))
        .factories(Arc::clone(parent.factories()))
        .build();
    sim.set_access_level(level);

    let mut configs: Vec<(String, DeviceConfig)> = parent
        .device_names()
        .into_iter()
        .filter_map(|name| {
            parent.device(&name).map(|dev| {
                let core = dev.core();
                let config = DeviceConfig {
                    class: core.class().to_string(),
                    params: core.config().clone(),
                };
                (name, config)
            })
        })
        .collect();
    configs.sort_by_key(|(_, c)| c.class == "alias");
    for (name, config) in configs {
        if let Err(err) = sim.create_device_from(&name, &config).await {
            warn!(device = %name, error = %err, "device not available in simulation");
        }
    }
    Ok(sim)
}

/// Start a dry run of `code` on behalf of a `level` user; `devices` get a
/// value summary.
///
/// The run is aborted at its next breakpoint once `timeout` of real time has
/// passed. The receiver yields messages and ends with exactly one
/// [`SimEvent::Finished`].
pub fn start(
    parent: Arc<Context>,
    level: AccessLevel,
    code: String,
    devices: Vec<String>,
    timeout: Duration,
) -> mpsc::UnboundedReceiver<SimEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let report = match fork(&parent, level).await {
            Ok(sim) => run(sim, code, &devices, timeout, tx.clone()).await,
            Err(err) => SimulationReport {
                elapsed: 0.0,
                devices: Vec::new(),
                error: Some(err.to_string()),
            },
        };
        let _ = tx.send(SimEvent::Finished(report));
    });
    rx
}

async fn run(
    sim: Arc<Context>,
    code: String,
    devices: &[String],
    timeout: Duration,
    tx: mpsc::UnboundedSender<SimEvent>,
) -> SimulationReport {
    let cancel = CancellationToken::new();
    let began = Instant::now();
    let deadline_token = cancel.clone();
    sim.set_breakpoint(Some(Arc::new(move || {
        if deadline_token.is_cancelled() || began.elapsed() > timeout {
            return Err(IcsError::Aborted("simulation timed out".into()));
        }
        Ok(())
    })));

    let sink_ctx = Arc::clone(&sim);
    let sink: EventSink = Arc::new(move |event| {
        if let HostEvent::Message { level, text } = event {
            let _ = tx.send(SimEvent::Message {
                time: sink_ctx.now(),
                level,
                text: format!("{}{}", SIM_PREFIX, text),
            });
        }
    });

    let host = ScriptHost::new(Arc::clone(&sim), Handle::current(), sink);
    let task = tokio::task::spawn_blocking(move || host.run(&code));
    let result = match tokio::time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(IcsError::Script(format!("simulation crashed: {}", join))),
        Err(_) => {
            cancel.cancel();
            Err(IcsError::Aborted("simulation timed out".into()))
        }
    };

    let report = SimulationReport {
        elapsed: sim.clock().elapsed(),
        devices: devices.iter().map(|name| summarize(&sim, name)).collect(),
        error: result.err().map(|err| err.to_string()),
    };
    debug!(elapsed = report.elapsed, error = ?report.error, "simulation finished");
    sim.set_breakpoint(None);
    sim.shutdown().await;
    report
}

fn summarize(sim: &Context, name: &str) -> DeviceSummary {
    let Some(device) = sim.device(name) else {
        return DeviceSummary {
            name: name.to_string(),
            min: None,
            max: None,
            last: None,
        };
    };
    let core = device.core();
    let state = core.sim_state();
    DeviceSummary {
        name: device.name().to_string(),
        min: state.min.map(|x| core.format(&json!(x))),
        max: state.max.map(|x| core.format(&json!(x))),
        last: state.value.as_ref().map(|v| core.format(v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::device::readable;

    async fn parent() -> Arc<Context> {
        let ctx = Context::builder(Arc::new(Settings::default()))
            .cache(Arc::new(LocalCache::in_memory()))
            .build();
        let config = DeviceConfig::new("virtual_motor")
            .with("abslimits", json!([-100.0, 100.0]))
            .with("speed", 2.0)
            .with("fmtstr", "%.1f");
        let motor = ctx.create_device_from("m1", &config).await.unwrap();
        readable(&*motor).unwrap().read(None).await.unwrap();
        ctx
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<SimEvent>) -> (Vec<String>, SimulationReport) {
        let mut messages = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SimEvent::Message { text, .. } => messages.push(text),
                SimEvent::Finished(report) => return (messages, report),
            }
        }
        panic!("simulation ended without a report");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_move_uses_virtual_time() {
        let ctx = parent().await;
        let real = Instant::now();
        let rx = start(
            Arc::clone(&ctx),
            AccessLevel::User,
            r#"maw("m1", 10.0); print("done");"#.into(),
            vec!["m1".into()],
            Duration::from_secs(10),
        );
        let (messages, report) = collect(rx).await;
        assert!(real.elapsed() < Duration::from_secs(2));
        assert_eq!(report.error, None);
        assert!((report.elapsed - 5.0).abs() < 1e-6, "{}", report.elapsed);
        assert_eq!(messages, vec!["(sim) done".to_string()]);
        assert_eq!(
            report.devices[0],
            DeviceSummary {
                name: "m1".into(),
                min: Some("0.0".into()),
                max: Some("10.0".into()),
                last: Some("10.0".into()),
            }
        );

        // the parent motor never moved
        let motor = ctx.device("m1").unwrap();
        let value = readable(&*motor).unwrap().read(Some(0.0)).await.unwrap();
        assert_eq!(value, json!(0.0));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sleep_and_count_advance_clock() {
        let ctx = parent().await;
        ctx.create_device_from("timer", &DeviceConfig::new("virtual_timer"))
            .await
            .unwrap();
        let rx = start(
            ctx,
            AccessLevel::User,
            r#"sleep(3); count("timer", 2.5);"#.into(),
            vec!["unknown".into()],
            Duration::from_secs(10),
        );
        let (_, report) = collect(rx).await;
        assert_eq!(report.error, None);
        assert!((report.elapsed - 5.5).abs() < 1e-6);
        assert_eq!(report.devices[0].last, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_runaway_script_times_out() {
        let ctx = parent().await;
        let rx = start(
            ctx,
            AccessLevel::User,
            "let x = 0; loop { x += 1; }".into(),
            Vec::new(),
            Duration::from_millis(200),
        );
        let (_, report) = collect(rx).await;
        assert!(report.error.unwrap().contains("timed out"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_script_error_is_reported() {
        let ctx = parent().await;
        let rx = start(
            ctx,
            AccessLevel::User,
            r#"maw("m1", 1000.0);"#.into(),
            Vec::new(),
            Duration::from_secs(10),
        );
        let (_, report) = collect(rx).await;
        assert!(report.error.unwrap().contains("limit error"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dry_run_uses_requesting_user_level() {
        let ctx = parent().await;
        let config = DeviceConfig::new("virtual_motor")
            .with("abslimits", json!([-100.0, 100.0]))
            .with("requires", "admin");
        ctx.create_device_from("guarded", &config).await.unwrap();
        assert_eq!(ctx.access_level(), AccessLevel::Admin);

        let code = r#"maw("guarded", 10.0);"#;
        let rx = start(Arc::clone(&ctx), AccessLevel::User, code.into(), Vec::new(), Duration::from_secs(10));
        let (_, report) = collect(rx).await;
        let error = report.error.unwrap();
        assert!(error.contains("admin access is required"), "{}", error);

        let rx = start(ctx, AccessLevel::Admin, code.into(), Vec::new(), Duration::from_secs(10));
        let (_, report) = collect(rx).await;
        assert_eq!(report.error, None);
    }
}
