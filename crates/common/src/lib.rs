//! Common types for usbwarden
//!
//! This crate provides the data model shared between the daemon's components
//! (device events, allow-list entries, decisions, enforcement outcomes),
//! the error type and the logging setup.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use logging::setup_logging;
pub use types::{
    AllowListEntry, Decision, DenyReason, DeviceAction, DeviceEvent, EnforcementOutcome,
    OutcomeRecord,
};
