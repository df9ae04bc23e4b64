//! Core library of the rust_ics instrument control system.
//!
//! Processes share device state through a key/value/time cache
//! ([`cache`]). Devices ([`device`]) bind their parameters to that cache and
//! to hardware; pollers ([`poller`]) keep the cache fresh in the background;
//! the daemon ([`daemon`]) runs user scripts against the devices, and can
//! dry-run them on a virtual clock.
//!
//! # Architecture
//!
//! ```text
//!  daemon ──┐                        ┌── poller child (setup A)
//!           ├── Context ── devices ──┤
//!  scripts ─┘        │               └── poller child (setup B)
//!                    ▼                            │
//!               CacheClient ◄──── TCP ────► CacheServer ──► day files
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod context;
pub mod daemon;
pub mod device;
pub mod error;
pub mod logging;
pub mod poller;

pub use context::{Context, Mode};
pub use error::{AppResult, IcsError};
