//! usbwarden daemon library
//!
//! Watches USB hotplug events, checks every device against an allow-list
//! and unbinds the ones that are not listed.

pub mod audit;
pub mod config;
pub mod engine;
pub mod enforcement;
pub mod guard;
pub mod monitor;
pub mod notify;
pub mod policy;
pub mod service;

pub use engine::{IdFormat, decide};
pub use enforcement::{Enforcer, SysfsUnbind, UnbindControl};
pub use guard::{ControlSignal, Guard, GuardState, ShutdownReason};
pub use monitor::{DeviceTracker, EventSource, UeventMonitor};
pub use notify::{LogNotifier, Notifier};
pub use policy::{AllowList, LoadReport, PolicyStore};
