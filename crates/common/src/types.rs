//! Device authorization data model
//!
//! Types flowing between the event source, the authorization engine, the
//! enforcement actuator and the notifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What happened to a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAction {
    /// Device was plugged in
    Attached,
    /// Device was removed
    Detached,
    /// Device was already present when monitoring started
    Existing,
}

impl DeviceAction {
    /// Whether the device is still connected after this event
    pub fn is_present(&self) -> bool {
        !matches!(self, DeviceAction::Detached)
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAction::Attached => write!(f, "attached"),
            DeviceAction::Detached => write!(f, "detached"),
            DeviceAction::Existing => write!(f, "existing"),
        }
    }
}

/// One observed USB hotplug occurrence
///
/// Identity attributes are kept as the raw strings exposed by sysfs; the
/// authorization engine owns their interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub action: DeviceAction,
    /// Device file, e.g. `/dev/bus/usb/001/004`
    pub devnode: Option<String>,
    /// Kernel topology path, e.g. `/devices/pci0000:00/0000:00:14.0/usb1/1-2`
    pub devpath: String,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    pub serial: Option<String>,
}

impl DeviceEvent {
    /// Create an event with no device node and no identity attributes
    pub fn new(action: DeviceAction, devpath: impl Into<String>) -> Self {
        Self {
            action,
            devnode: None,
            devpath: devpath.into(),
            vendor_id: None,
            product_id: None,
            serial: None,
        }
    }

    /// Set the device node
    pub fn with_devnode(mut self, devnode: impl Into<String>) -> Self {
        self.devnode = Some(devnode.into());
        self
    }

    /// Set all three identity attributes
    pub fn with_identity(
        mut self,
        vendor_id: impl Into<String>,
        product_id: impl Into<String>,
        serial: impl Into<String>,
    ) -> Self {
        self.vendor_id = Some(vendor_id.into());
        self.product_id = Some(product_id.into());
        self.serial = Some(serial.into());
        self
    }

    /// Short `vid:pid serial` label for log lines
    pub fn identity_label(&self) -> String {
        identity_label(
            self.vendor_id.as_deref(),
            self.product_id.as_deref(),
            self.serial.as_deref(),
        )
    }
}

/// Final non-empty segment of a kernel topology path (`1-2.4`, `usb1`, ...)
pub fn bus_address_token(devpath: &str) -> Option<&str> {
    devpath.split('/').filter(|s| !s.is_empty()).next_back()
}

fn identity_label(vendor: Option<&str>, product: Option<&str>, serial: Option<&str>) -> String {
    format!(
        "{}:{} serial={}",
        vendor.unwrap_or("?"),
        product.unwrap_or("?"),
        serial.unwrap_or("?")
    )
}

/// One administrator-authorized device identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowListEntry {
    /// Matched as a prefix of the observed serial
    pub serial: String,
    pub vendor_id: u32,
    pub product_id: u32,
}

impl AllowListEntry {
    pub fn new(serial: impl Into<String>, vendor_id: u32, product_id: u32) -> Self {
        Self {
            serial: serial.into(),
            vendor_id,
            product_id,
        }
    }

    /// Check whether an observed identity satisfies this entry
    pub fn matches(&self, serial: &str, vendor_id: u32, product_id: u32) -> bool {
        let prefix = self.serial.as_bytes();
        let observed = serial.as_bytes();
        prefix.len() <= observed.len()
            && &observed[..prefix.len()] == prefix
            && self.vendor_id == vendor_id
            && self.product_id == product_id
    }
}

impl fmt::Display for AllowListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.serial, self.vendor_id, self.product_id)
    }
}

/// Authorization result for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Why a device was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// Vendor id, product id or serial was missing
    IncompleteIdentity,
    /// Identity complete but no allow-list entry matched
    NotInAllowList,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Deny(DenyReason::IncompleteIdentity) => {
                write!(f, "deny (incomplete identity)")
            }
            Decision::Deny(DenyReason::NotInAllowList) => write!(f, "deny (not in allow-list)"),
        }
    }
}

/// Result of an unbind attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementOutcome {
    /// Driver binding severed
    Success,
    /// Not attempted or not retryable (control interface could not be opened)
    Failed(String),
    /// Every write attempt failed
    GaveUpAfterRetries { last_error: String },
}

impl EnforcementOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EnforcementOutcome::Success)
    }
}

impl fmt::Display for EnforcementOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnforcementOutcome::Success => write!(f, "unbound"),
            EnforcementOutcome::Failed(reason) => write!(f, "unbind failed: {}", reason),
            EnforcementOutcome::GaveUpAfterRetries { last_error } => {
                write!(f, "unbind abandoned after retries: {}", last_error)
            }
        }
    }
}

/// Structured outcome handed to notifiers for every processed event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub action: DeviceAction,
    pub devnode: Option<String>,
    pub devpath: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    pub decision: Decision,
    /// `None` when no enforcement was attempted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enforcement: Option<EnforcementOutcome>,
}

impl OutcomeRecord {
    pub fn new(
        event: DeviceEvent,
        decision: Decision,
        enforcement: Option<EnforcementOutcome>,
    ) -> Self {
        Self {
            action: event.action,
            devnode: event.devnode,
            devpath: event.devpath,
            vendor_id: event.vendor_id,
            product_id: event.product_id,
            serial: event.serial,
            decision,
            enforcement,
        }
    }

    pub fn identity_label(&self) -> String {
        identity_label(
            self.vendor_id.as_deref(),
            self.product_id.as_deref(),
            self.serial.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_address_token() {
        assert_eq!(
            bus_address_token("/devices/pci0000:00/0000:00:14.0/usb1/1-2"),
            Some("1-2")
        );
        assert_eq!(bus_address_token("/devices/usb2/2-1/2-1.4/"), Some("2-1.4"));
        assert_eq!(bus_address_token("usb1"), Some("usb1"));
        assert_eq!(bus_address_token("///"), None);
        assert_eq!(bus_address_token(""), None);
    }

    #[test]
    fn test_entry_serial_prefix() {
        let entry = AllowListEntry::new("A1B2C3", 1234, 5678);
        assert!(entry.matches("A1B2C3", 1234, 5678));
        assert!(entry.matches("A1B2C3XYZ", 1234, 5678));
        assert!(!entry.matches("A1B2", 1234, 5678));
        assert!(!entry.matches("XA1B2C3", 1234, 5678));
        assert!(!entry.matches("A1B2C3", 1234, 9999));
        assert!(!entry.matches("A1B2C3", 4321, 5678));
    }

    #[test]
    fn test_identity_label_marks_missing() {
        let event = DeviceEvent::new(DeviceAction::Attached, "/devices/usb1/1-1");
        assert_eq!(event.identity_label(), "?:? serial=?");

        let event = event.with_identity("1234", "5678", "ABC");
        assert_eq!(event.identity_label(), "1234:5678 serial=ABC");
    }

    #[test]
    fn test_outcome_record_serialization() {
        let event = DeviceEvent::new(DeviceAction::Attached, "/devices/usb1/1-1")
            .with_devnode("/dev/bus/usb/001/002")
            .with_identity("1234", "5678", "ABC");
        let record = OutcomeRecord::new(
            event,
            Decision::Deny(DenyReason::NotInAllowList),
            Some(EnforcementOutcome::Success),
        );

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"action\":\"attached\""));
        assert!(json.contains("not_in_allow_list"));
        assert!(json.contains("\"enforcement\":\"success\""));

        let parsed: OutcomeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
