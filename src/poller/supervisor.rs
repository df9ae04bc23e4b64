//! Poller fleet supervision.
//!
//! The supervisor keeps one child poller per active setup. The active set is
//! the list stored under `<session>/mastersetup` (when `autosetup` is on) plus
//! the configured `alwayspoll` setups. Whenever the master setup key changes
//! only the difference is applied: children of removed setups are terminated,
//! new setups get a child, untouched children keep running. A child that exits
//! while its setup is still active is restarted.
//!
//! # Architecture
//!
//! ```text
//!  cache callback ──MasterSetups──┐
//!                                 ▼
//!  monitor task (per child) ──Exited──► mpsc ──► PollerSupervisor::run
//!        │                                             │
//!        └── ChildLauncher::launch(setup) ◄── spawn ───┘
//! ```

use super::setup::DUMMY_SETUP;
use crate::cache::Cache;
use crate::config::Settings;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before restarting a child that exited on its own.
pub const RESTART_DELAY: Duration = Duration::from_secs(1);

/// A running child poller.
#[async_trait]
pub trait PollerChild: Send {
    fn id(&self) -> Option<u32>;

    /// Wait for the child to exit and describe how it ended.
    async fn wait(&mut self) -> String;

    async fn terminate(&mut self);
}

/// Starts child pollers for setups.
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn launch(&self, setup: &str) -> AppResult<Box<dyn PollerChild>>;
}

// =============================================================================
// Process children
// =============================================================================

/// Launches `<program> [--config <path>] poller --setup <setup>` processes.
pub struct ProcessLauncher {
    program: PathBuf,
    config: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, config: Option<PathBuf>) -> Self {
        Self {
            program: program.into(),
            config,
        }
    }

    /// Launcher re-executing the running binary.
    pub fn current_exe(config: Option<PathBuf>) -> AppResult<Self> {
        Ok(Self::new(std::env::current_exe()?, config))
    }
}

struct ProcessChild {
    child: tokio::process::Child,
}

#[async_trait]
impl PollerChild for ProcessChild {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => status.to_string(),
            Err(err) => format!("wait failed: {}", err),
        }
    }

    async fn terminate(&mut self) {
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "killing poller child failed");
        }
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn launch(&self, setup: &str) -> AppResult<Box<dyn PollerChild>> {
        let mut command = Command::new(&self.program);
        if let Some(config) = &self.config {
            command.arg("--config").arg(config);
        }
        command.args(["poller", "--setup", setup]).kill_on_drop(true);
        let child = command.spawn()?;
        Ok(Box::new(ProcessChild { child }))
    }
}

// =============================================================================
// Supervisor
// =============================================================================

#[derive(Debug)]
enum SupervisorEvent {
    MasterSetups(Vec<String>),
    Exited {
        setup: String,
        generation: u64,
        reason: String,
    },
}

struct RunningChild {
    generation: u64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Setups that should have a poller.
pub fn desired_setups(autosetup: bool, master: &[String], alwayspoll: &[String]) -> BTreeSet<String> {
    let mut setups: BTreeSet<String> = alwayspoll.iter().cloned().collect();
    if autosetup {
        setups.extend(master.iter().cloned());
    }
    setups
}

fn setup_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

pub struct PollerSupervisor {
    settings: Arc<Settings>,
    cache: Arc<dyn Cache>,
    launcher: Arc<dyn ChildLauncher>,
    cancel: CancellationToken,
    restart_delay: Duration,
}

impl PollerSupervisor {
    pub fn new(settings: Arc<Settings>, cache: Arc<dyn Cache>, launcher: Arc<dyn ChildLauncher>) -> Self {
        Self {
            settings,
            cache,
            launcher,
            cancel: CancellationToken::new(),
            restart_delay: RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn master_key(&self) -> String {
        format!("{}/mastersetup", self.settings.application.session)
    }

    /// Supervise children until the shutdown token is cancelled.
    pub async fn run(self) -> AppResult<()> {
        let poller = &self.settings.poller;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let master = if poller.autosetup {
            match self.cache.get_value(&self.master_key(), 0.0).await {
                Ok(value) => value.as_ref().map(setup_list).unwrap_or_default(),
                Err(err) => {
                    warn!(error = %err, "could not read master setups");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        let mut active = desired_setups(poller.autosetup, &master, &poller.alwayspoll);
        if active.is_empty() {
            active.insert(DUMMY_SETUP.to_string());
        }

        let subscription = if poller.autosetup {
            let events = tx.clone();
            let callback = Arc::new(move |entry: &crate::cache::CacheEntry| {
                if !entry.expired {
                    let _ = events.send(SupervisorEvent::MasterSetups(setup_list(&entry.value)));
                }
            });
            Some(self.cache.add_callback(&self.master_key(), callback).await?)
        } else {
            None
        };

        let mut generation = 0u64;
        let mut children: HashMap<String, RunningChild> = HashMap::new();
        for setup in &active {
            generation += 1;
            children.insert(setup.clone(), self.spawn_child(setup, generation, None, &tx));
        }
        info!(setups = ?active, "poller supervisor started");

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => event,
            };
            let Some(event) = event else { break };
            match event {
                SupervisorEvent::MasterSetups(master) => {
                    let mut wanted = desired_setups(true, &master, &poller.alwayspoll);
                    if wanted.is_empty() {
                        wanted.insert(DUMMY_SETUP.to_string());
                    }
                    info!(setups = ?wanted, "reconfiguring for new master setups");
                    for setup in active.difference(&wanted) {
                        if let Some(child) = children.remove(setup) {
                            child.token.cancel();
                        }
                    }
                    for setup in wanted.difference(&active) {
                        generation += 1;
                        children.insert(setup.clone(), self.spawn_child(setup, generation, None, &tx));
                    }
                    active = wanted;
                }
                SupervisorEvent::Exited {
                    setup,
                    generation: exited,
                    reason,
                } => {
                    let current = children.get(&setup).is_some_and(|c| c.generation == exited);
                    if current && active.contains(&setup) {
                        warn!(%setup, %reason, "poller terminated, restarting");
                        generation += 1;
                        let delay = Some(self.restart_delay);
                        children.insert(setup.clone(), self.spawn_child(&setup, generation, delay, &tx));
                    } else {
                        info!(%setup, %reason, "poller terminated");
                    }
                }
            }
        }

        info!("poller supervisor quitting");
        if let Some(id) = subscription {
            if let Err(err) = self.cache.remove_callback(id).await {
                debug!(error = %err, "removing master setup subscription failed");
            }
        }
        for (_, child) in children.drain() {
            child.token.cancel();
            if let Err(err) = child.handle.await {
                debug!(error = %err, "child monitor ended abnormally");
            }
        }
        info!("all pollers terminated");
        Ok(())
    }

    fn spawn_child(
        &self,
        setup: &str,
        generation: u64,
        delay: Option<Duration>,
        events: &mpsc::UnboundedSender<SupervisorEvent>,
    ) -> RunningChild {
        let token = self.cancel.child_token();
        let handle = tokio::spawn(monitor_child(
            setup.to_string(),
            generation,
            delay,
            Arc::clone(&self.launcher),
            token.clone(),
            events.clone(),
        ));
        RunningChild {
            generation,
            token,
            handle,
        }
    }
}

async fn monitor_child(
    setup: String,
    generation: u64,
    delay: Option<Duration>,
    launcher: Arc<dyn ChildLauncher>,
    token: CancellationToken,
    events: mpsc::UnboundedSender<SupervisorEvent>,
) {
    if let Some(delay) = delay {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    let mut child = match launcher.launch(&setup).await {
        Ok(child) => child,
        Err(err) => {
            let reason = IcsError::comm(setup.as_str(), format!("could not start poller: {}", err)).to_string();
            let _ = events.send(SupervisorEvent::Exited {
                setup,
                generation,
                reason,
            });
            return;
        }
    };
    info!(%setup, pid = ?child.id(), "started poller");
    tokio::select! {
        biased;
        _ = token.cancelled() => {
            child.terminate().await;
            debug!(%setup, "poller stopped");
        }
        reason = child.wait() => {
            let _ = events.send(SupervisorEvent::Exited { setup, generation, reason });
        }
    }
}
