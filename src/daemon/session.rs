//! Script execution session of the daemon.
//!
//! Scripts are queued and run one at a time, in submission order, on a
//! blocking thread. Clients observe the session through a broadcast stream of
//! [`Event`]s; every privileged command is checked against the submitting
//! user's level.
//!
//! # Architecture
//!
//! ```text
//! clients ──submit/stop/pause──► DaemonSession ──► queue ──► run loop
//!    ▲                               │                          │
//!    └──────── broadcast<Event> ◄────┴──── ScriptHost (spawn_blocking)
//! ```

use super::auth::{self, AccessLevel, User};
use super::bindings::{help_text, EventSink, HostEvent, ScriptHost};
use super::protocol::Event;
use super::script::{Script, ScriptControl, ScriptState};
use super::simulation::{self, SimEvent};
use crate::clock;
use crate::context::{Context, Mode};
use crate::error::{AppResult, IcsError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Buffered events per subscriber before the slowest one starts lagging.
const EVENT_BUFFER: usize = 1024;

pub struct DaemonSession {
    ctx: Arc<Context>,
    control: Arc<ScriptControl>,
    queue: Mutex<VecDeque<Script>>,
    current: Mutex<Option<u64>>,
    next_id: AtomicU64,
    events: broadcast::Sender<Event>,
    wakeup: Notify,
    cancel: CancellationToken,
    sim_timeout: Duration,
}

impl DaemonSession {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        let sim_timeout = Duration::from_secs_f64(ctx.settings().daemon.simulation_timeout_s.max(0.0));
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            ctx,
            control: ScriptControl::new(),
            queue: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events,
            wakeup: Notify::new(),
            cancel: CancellationToken::new(),
            sim_timeout,
        })
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> ScriptState {
        self.control.state()
    }

    pub fn status_event(&self) -> Event {
        Event::Status {
            state: self.control.state(),
            script: *self.current.lock(),
            queue: self.queue.lock().len(),
        }
    }

    fn emit(&self, event: Event) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn emit_status(&self) {
        self.emit(self.status_event());
    }

    fn message(&self, level: &str, text: impl Into<String>, script: Option<u64>) {
        self.emit(Event::Message {
            time: clock::now(),
            level: level.to_string(),
            text: text.into(),
            script,
        });
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Queue a script; returns its id.
    pub fn submit(&self, user: &User, code: String, name: Option<String>) -> AppResult<u64> {
        auth::require(user.level, AccessLevel::User, None, "running scripts")?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let script = Script {
            id,
            name: name.unwrap_or_else(|| format!("script {}", id)),
            code,
            user: user.clone(),
            submitted: clock::now(),
        };
        info!(id, name = %script.name, user = %user.name, "script queued");
        self.queue.lock().push_back(script);
        self.wakeup.notify_one();
        self.emit_status();
        Ok(id)
    }

    /// Stop the running script, or drop the queued script `id`.
    pub fn stop(&self, user: &User, id: Option<u64>) -> AppResult<()> {
        auth::require(user.level, AccessLevel::User, None, "stopping scripts")?;
        let current = *self.current.lock();
        match id {
            Some(id) if Some(id) != current => {
                let removed = {
                    let mut queue = self.queue.lock();
                    let before = queue.len();
                    queue.retain(|s| s.id != id);
                    queue.len() != before
                };
                if !removed {
                    return Err(IcsError::Script(format!("no script with id {}", id)));
                }
                info!(id, user = %user.name, "queued script removed");
                self.emit_status();
                Ok(())
            }
            _ => {
                if !self.control.stop() {
                    return Err(IcsError::Script("no script is running".into()));
                }
                info!(user = %user.name, "stop requested");
                self.emit_status();
                Ok(())
            }
        }
    }

    pub fn pause(&self, user: &User) -> AppResult<()> {
        auth::require(user.level, AccessLevel::User, None, "pausing scripts")?;
        if !self.control.pause() {
            return Err(IcsError::Script(format!(
                "cannot pause while {}",
                self.control.state()
            )));
        }
        self.emit_status();
        Ok(())
    }

    pub fn resume(&self, user: &User) -> AppResult<()> {
        auth::require(user.level, AccessLevel::User, None, "resuming scripts")?;
        if !self.control.resume() {
            return Err(IcsError::Script(format!(
                "cannot resume while {}",
                self.control.state()
            )));
        }
        self.emit_status();
        Ok(())
    }

    pub fn set_mode(&self, user: &User, mode: Mode) -> AppResult<()> {
        auth::require(user.level, AccessLevel::Admin, None, "changing the mode")?;
        if mode == Mode::Simulation {
            return Err(IcsError::Usage {
                device: None,
                message: "use simulate for dry runs".into(),
            });
        }
        self.ctx.set_mode(mode);
        self.emit(Event::Mode { mode });
        Ok(())
    }

    pub fn help(&self, topic: Option<&str>) -> Event {
        Event::ShowHelp {
            topic: topic.unwrap_or_default().to_string(),
            text: help_text(topic),
        }
    }

    /// Dry-run `code` next to whatever is running; results arrive as
    /// `message` events and one `simulation` event carrying the returned id.
    /// The dry run acts with the requesting user's rights.
    pub fn simulate(self: &Arc<Self>, user: &User, code: String, devices: Vec<String>) -> AppResult<u64> {
        auth::require(user.level, AccessLevel::User, None, "simulating scripts")?;
        let mode = self.ctx.mode();
        if matches!(mode, Mode::Slave | Mode::Simulation) {
            return Err(IcsError::Mode {
                device: None,
                message: format!("dry runs are not possible in {} mode", mode),
            });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut rx = simulation::start(Arc::clone(&self.ctx), user.level, code, devices, self.sim_timeout);
        let session = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    SimEvent::Message { time, level, text } => session.emit(Event::Message {
                        time,
                        level,
                        text,
                        script: Some(id),
                    }),
                    SimEvent::Finished(report) => {
                        session.emit(Event::Simulation {
                            id,
                            elapsed: report.elapsed,
                            devices: report.devices,
                            error: report.error,
                        });
                        break;
                    }
                }
            }
        });
        Ok(id)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run queued scripts until the shutdown token is cancelled.
    pub async fn run(self: Arc<Self>) {
        loop {
            let next = self.queue.lock().pop_front();
            match next {
                Some(script) => self.execute(script).await,
                None => {
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = self.wakeup.notified() => {}
                    }
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }
        }
        self.control.stop();
        info!("script loop finished");
    }

    async fn execute(&self, script: Script) {
        if let Err(err) = self.control.start() {
            error!(id = script.id, error = %err, "script not started");
            return;
        }
        *self.current.lock() = Some(script.id);
        self.ctx.set_access_level(script.user.level);
        self.ctx.set_breakpoint(Some(self.control.breakpoint()));
        self.emit_status();
        self.message("info", format!("starting {}", script.name), Some(script.id));

        let events = self.events.clone();
        let clock_ctx = Arc::clone(&self.ctx);
        let id = script.id;
        let sink: EventSink = Arc::new(move |event| {
            let time = clock_ctx.now();
            let event = match event {
                HostEvent::Message { level, text } => Event::Message {
                    time,
                    level,
                    text,
                    script: Some(id),
                },
                HostEvent::LiveParams { device, preset } => Event::LiveParams { device, preset, time },
                HostEvent::LiveData { device, value } => Event::LiveData { device, time, value },
            };
            let _ = events.send(event);
        });

        let host = ScriptHost::new(Arc::clone(&self.ctx), Handle::current(), sink);
        let code = script.code;
        let result = match tokio::task::spawn_blocking(move || host.run(&code)).await {
            Ok(result) => result,
            Err(join) => Err(IcsError::Script(format!("script thread failed: {}", join))),
        };

        let state = self.control.finish();
        self.ctx.set_breakpoint(None);
        self.ctx.set_access_level(AccessLevel::Admin);
        *self.current.lock() = None;
        match result {
            Ok(()) => self.message("info", format!("{} finished", script.name), Some(id)),
            Err(IcsError::Aborted(reason)) => {
                warn!(id, %reason, "script aborted");
                self.message("warning", format!("{} stopped: {}", script.name, reason), Some(id));
            }
            Err(err) => {
                warn!(id, error = %err, "script failed");
                self.message("error", err.to_string(), Some(id));
            }
        }
        info!(id, %state, "script done");
        self.emit_status();
    }
}
