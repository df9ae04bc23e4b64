//! Per-device poll worker.
//!
//! A [`PollWorker`] owns one device name. It resolves the device lazily
//! (retrying with doubling backoff while the hardware is unreachable), then
//! samples `(status, value)` in a loop. Sampling goes through
//! [`Readable::poll`](crate::device::Readable::poll), which stores both in the
//! cache with the device's `maxage` as TTL.
//!
//! The pace is decided by [`PollSchedule`]:
//!
//! ```text
//!            target key written
//!  Normal ─────────────────────────► StartedMoving
//!    ▲                                     │ next successful poll
//!    │ status != BUSY                      ▼ (interval = 0.5 s)
//!    └─────────────────────────────── Moving
//!
//!  pollinterval key written ──► NewInterval ──next success──► Normal
//! ```
//!
//! Five consecutive errors are logged; after that the interval is multiplied
//! by five until the next success.

use crate::cache::{Cache, CallbackId};
use crate::device::{Device, Status, StatusCode};
use crate::error::AppResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval while a movement is in progress.
pub const MOVING_INTERVAL: f64 = 0.5;

/// Errors logged before the worker goes quiet and slows down.
pub const ERROR_LOG_LIMIT: u32 = 5;

/// Interval multiplier while a device keeps failing.
pub const ERROR_INTERVAL_FACTOR: f64 = 5.0;

/// First and maximum delay between attempts to create a device.
pub const CREATE_RETRY_INITIAL: Duration = Duration::from_secs(30);
pub const CREATE_RETRY_MAX: Duration = Duration::from_secs(600);

/// Something that can produce a device handle by name.
#[async_trait]
pub trait DeviceResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> AppResult<Arc<dyn Device>>;
}

// =============================================================================
// Schedule
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Normal,
    /// `target` was written; speed up after the next sample.
    StartedMoving,
    Moving,
    /// `pollinterval` was written; pick it up after the next sample.
    NewInterval,
}

/// Cache-driven reconfiguration of a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEvent {
    TargetChanged,
    IntervalChanged,
}

/// Interval and motion state of one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSchedule {
    state: MotionState,
    /// Seconds between samples; `None` waits for a reconfiguration.
    interval: Option<f64>,
    errors: u32,
}

impl PollSchedule {
    pub fn new(pollinterval: Option<f64>) -> Self {
        Self {
            state: MotionState::Normal,
            interval: pollinterval,
            errors: 0,
        }
    }

    pub fn state(&self) -> MotionState {
        self.state
    }

    pub fn interval(&self) -> Option<f64> {
        self.interval
    }

    pub fn errors(&self) -> u32 {
        self.errors
    }

    pub fn notify(&mut self, event: PollEvent) {
        self.state = match event {
            PollEvent::TargetChanged => MotionState::StartedMoving,
            PollEvent::IntervalChanged => MotionState::NewInterval,
        };
    }

    pub fn record_success(&mut self, status: &Status, pollinterval: Option<f64>) {
        if self.errors > 0 {
            self.interval = pollinterval;
            self.errors = 0;
        }
        match self.state {
            MotionState::StartedMoving => {
                self.interval = Some(MOVING_INTERVAL);
                self.state = MotionState::Moving;
            }
            MotionState::Moving if status.code != StatusCode::Busy => {
                self.interval = pollinterval;
                self.state = MotionState::Normal;
            }
            MotionState::NewInterval => {
                self.interval = pollinterval;
                self.state = MotionState::Normal;
            }
            MotionState::Moving | MotionState::Normal => {}
        }
    }

    /// Count a failed sample. Returns whether it should be logged.
    pub fn record_error(&mut self) -> bool {
        let log = self.errors < ERROR_LOG_LIMIT;
        if self.errors == ERROR_LOG_LIMIT {
            self.interval = self.interval.map(|i| i * ERROR_INTERVAL_FACTOR);
        }
        self.errors = self.errors.saturating_add(1);
        log
    }
}

// =============================================================================
// Worker
// =============================================================================

pub struct PollWorker {
    device: String,
    resolver: Arc<dyn DeviceResolver>,
    cache: Option<Arc<dyn Cache>>,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    pending: Arc<Mutex<Option<PollEvent>>>,
}

impl PollWorker {
    pub fn new(
        device: impl Into<String>,
        resolver: Arc<dyn DeviceResolver>,
        cache: Option<Arc<dyn Cache>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device: device.into(),
            resolver,
            cache,
            cancel,
            wake: Arc::new(Notify::new()),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Resolve the device and poll until cancelled.
    pub async fn run(self) {
        let Some(device) = self.resolve().await else {
            return;
        };
        if device.as_readable().is_none() {
            debug!(device = %self.device, "not a readable device, not polling");
            return;
        }
        let subscriptions = self.subscribe(device.as_ref()).await;
        info!(device = %self.device, "starting polling loop");
        self.poll_loop(device.as_ref()).await;
        if let Some(cache) = &self.cache {
            for id in subscriptions {
                if let Err(err) = cache.remove_callback(id).await {
                    debug!(device = %self.device, error = %err, "removing subscription failed");
                }
            }
        }
        debug!(device = %self.device, "polling loop finished");
    }

    async fn resolve(&self) -> Option<Arc<dyn Device>> {
        let mut delay = CREATE_RETRY_INITIAL;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.resolver.resolve(&self.device).await {
                Ok(device) => return Some(device),
                Err(err) => {
                    warn!(
                        device = %self.device,
                        error = %err,
                        retry_secs = delay.as_secs(),
                        "error creating device, trying again later"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(CREATE_RETRY_MAX);
                }
            }
        }
    }

    async fn subscribe(&self, device: &dyn Device) -> Vec<CallbackId> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        for (param, event) in [
            ("target", PollEvent::TargetChanged),
            ("pollinterval", PollEvent::IntervalChanged),
        ] {
            let wake = Arc::clone(&self.wake);
            let pending = Arc::clone(&self.pending);
            let key = device.core().key(param);
            let callback = Arc::new(move |_: &crate::cache::CacheEntry| {
                *pending.lock() = Some(event);
                wake.notify_one();
            });
            match cache.add_callback(&key, callback).await {
                Ok(id) => ids.push(id),
                Err(err) => warn!(device = %self.device, %key, error = %err, "subscription failed"),
            }
        }
        ids
    }

    async fn poll_loop(&self, device: &dyn Device) {
        let Some(readable) = device.as_readable() else {
            return;
        };
        let core = device.core();
        let mut schedule = PollSchedule::new(core.float("pollinterval"));
        let mut n: u64 = 0;
        while !self.cancel.is_cancelled() {
            n += 1;
            match readable.poll(n, None).await {
                Ok((status, value)) => {
                    debug!(device = %self.device, %status, %value, "polled");
                    schedule.record_success(&status, core.float("pollinterval"));
                }
                Err(err) => {
                    if schedule.record_error() {
                        warn!(device = %self.device, error = %err, "error reading device");
                    }
                }
            }

            let sleep = async {
                match schedule.interval() {
                    Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep => {}
            }
            if let Some(event) = self.pending.lock().take() {
                schedule.notify(event);
            }
        }
    }
}
