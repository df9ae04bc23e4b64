//! Script execution daemon.
//!
//! ```text
//! DaemonServer (TCP, JSON lines)
//!     └── DaemonSession ── queue ── ScriptHost (Rhai) ── devices
//!              └── simulation::start ── forked Context (virtual clock)
//! ```

pub mod auth;
pub mod bindings;
pub mod protocol;
pub mod script;
pub mod server;
pub mod session;
pub mod simulation;

pub use auth::{AccessLevel, AuthMethod, Authenticator, HashAlgorithm, User};
pub use bindings::{EventSink, HostEvent, ScriptHost};
pub use protocol::{Command, DeviceSummary, Event};
pub use script::{Script, ScriptControl, ScriptState};
pub use server::DaemonServer;
pub use session::DaemonSession;
pub use simulation::{SimEvent, SimulationReport};
