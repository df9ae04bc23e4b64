//! Background polling of device values and status into the cache.
//!
//! ```text
//! PollerSupervisor ── one child process per active setup ──► SetupPoller
//!                                                              │
//!                                          one task per device ▼
//!                                                           PollWorker
//! ```

pub mod setup;
pub mod supervisor;
pub mod worker;

pub use setup::{ContextResolver, SetupPoller, WorkerInfo, DUMMY_SETUP};
pub use supervisor::{ChildLauncher, PollerChild, PollerSupervisor, ProcessLauncher};
pub use worker::{DeviceResolver, MotionState, PollEvent, PollSchedule, PollWorker};
