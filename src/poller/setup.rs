//! Poller for a single setup.
//!
//! One [`SetupPoller`] runs inside each poller child process. It starts a
//! [`PollWorker`] task for every non-blacklisted device of its setup and stops
//! them all at once through a shared cancellation token.

use super::worker::{DeviceResolver, PollWorker};
use crate::context::Context;
use crate::device::Device;
use crate::error::{AppResult, IcsError};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Setup name that starts no workers; keeps a supervisor child alive while
/// nothing needs polling.
pub const DUMMY_SETUP: &str = "<dummy>";

/// Resolves devices through a [`Context`], one creation at a time.
pub struct ContextResolver {
    ctx: Arc<Context>,
    creation: tokio::sync::Mutex<()>,
}

impl ContextResolver {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            creation: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl DeviceResolver for ContextResolver {
    async fn resolve(&self, name: &str) -> AppResult<Arc<dyn Device>> {
        let _guard = self.creation.lock().await;
        match self.ctx.device(name) {
            Some(device) => Ok(device),
            None => self.ctx.create_device(name).await,
        }
    }
}

/// Liveness of one worker, as reported by [`SetupPoller::status_info`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub device: String,
    pub alive: bool,
}

pub struct SetupPoller {
    setup: String,
    ctx: Arc<Context>,
    resolver: Arc<dyn DeviceResolver>,
    cancel: CancellationToken,
    workers: Vec<(String, JoinHandle<()>)>,
}

impl SetupPoller {
    pub fn new(ctx: Arc<Context>, setup: impl Into<String>) -> Self {
        let resolver = Arc::new(ContextResolver::new(Arc::clone(&ctx)));
        Self::with_resolver(ctx, setup, resolver)
    }

    pub fn with_resolver(
        ctx: Arc<Context>,
        setup: impl Into<String>,
        resolver: Arc<dyn DeviceResolver>,
    ) -> Self {
        Self {
            setup: setup.into(),
            ctx,
            resolver,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
        }
    }

    pub fn setup(&self) -> &str {
        &self.setup
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawn one worker per device of the setup; returns how many started.
    pub fn start(&mut self) -> AppResult<usize> {
        info!(setup = %self.setup, "poller starting");
        if self.setup == DUMMY_SETUP {
            return Ok(0);
        }
        let settings = Arc::clone(self.ctx.settings());
        let setup = settings.setups.get(&self.setup).ok_or_else(|| {
            IcsError::settings(format!("setup '{}' does not exist", self.setup))
        })?;
        let blacklist = &settings.poller.blacklist;
        for name in setup.devices.keys() {
            if blacklist.iter().any(|b| b.eq_ignore_ascii_case(name)) {
                debug!(setup = %self.setup, device = %name, "not polling blacklisted device");
                continue;
            }
            debug!(setup = %self.setup, device = %name, "starting worker");
            let worker = PollWorker::new(
                name.clone(),
                Arc::clone(&self.resolver),
                self.ctx.cache().cloned(),
                self.cancel.child_token(),
            );
            self.workers.push((name.clone(), tokio::spawn(worker.run())));
        }
        Ok(self.workers.len())
    }

    pub fn status_info(&self) -> Vec<WorkerInfo> {
        self.workers
            .iter()
            .map(|(device, handle)| WorkerInfo {
                device: device.clone(),
                alive: !handle.is_finished(),
            })
            .collect()
    }

    /// Stop all workers and wait for them to finish.
    pub async fn quit(&mut self) {
        if !self.cancel.is_cancelled() {
            info!(setup = %self.setup, "poller quitting");
            self.cancel.cancel();
        }
        for (device, handle) in self.workers.drain(..) {
            if let Err(err) = handle.await {
                debug!(device = %device, error = %err, "worker task ended abnormally");
            }
        }
        self.ctx.shutdown().await;
        info!(setup = %self.setup, "poller finished");
    }

    /// Run until the shutdown token is cancelled, then quit.
    pub async fn wait(&mut self) {
        self.cancel.cancelled().await;
        self.quit().await;
    }
}
