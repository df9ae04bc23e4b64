//! Device layer.
//!
//! A device is a named piece of (possibly virtual) hardware with typed
//! parameters. Its in-process parameter values are kept consistent with the
//! shared cache by [`DeviceCore`]; what a device can do is expressed by the
//! capability traits in [`traits`] and [`capabilities`].
//!
//! # Architecture
//!
//! ```text
//! setup config ──> DeviceRegistry ──factory──> Arc<dyn Device>
//!                                                 │
//!                                    ┌────────────┴────────────┐
//!                                    │ DeviceCore              │
//!                                    │  params ◄──► Cache      │
//!                                    │  readers/writers ──► hw │
//!                                    └─────────────────────────┘
//! ```

pub mod alias;
pub mod capabilities;
pub mod core;
pub mod param;
pub mod registry;
pub mod status;
pub mod traits;
pub mod virtual_devices;

pub use self::core::{DeviceCore, SimState};
pub use alias::Alias;
pub use capabilities::{HasLimits, HasOffset, HasPrecision};
pub use param::{ParamSpec, ParamType, Parameter};
pub use registry::DeviceRegistry;
pub use status::{Status, StatusCode};
pub use traits::{measurable, moveable, readable, Device, Measurable, Moveable, Readable};
pub use virtual_devices::{VirtualMotor, VirtualSensor, VirtualTimer};
