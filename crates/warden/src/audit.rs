//! Audit logging
//!
//! Structured JSON-lines record of every authorization outcome, policy
//! reload and daemon start/stop, written by a background task to a
//! size-rotated file.

use crate::config::AuditConfig;
use crate::notify::Notifier;
use crate::policy::LoadReport;
use anyhow::{Context, Result};
use common::{Decision, EnforcementOutcome, OutcomeRecord};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Types of audit events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A device was authorized or denied
    DeviceDecision,
    /// The allow-list was re-read
    PolicyReloaded,
    DaemonStarted,
    DaemonStopped,
}

/// Result of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditResult {
    Success,
    Failure,
    /// Device denied and, when present, unbound
    Denied,
}

/// Details for different audit event types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AuditDetails {
    Device(OutcomeRecord),
    Policy {
        path: PathBuf,
        #[serde(skip_serializing_if = "Option::is_none")]
        entries: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        skipped: Option<usize>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Daemon {
        #[serde(skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// A structured audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp
    pub timestamp: String,
    pub event_type: AuditEventType,
    pub result: AuditResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<AuditDetails>,
}

impl AuditEntry {
    /// Create a new audit entry with the current timestamp
    pub fn new(event_type: AuditEventType, result: AuditResult) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| time_to_iso8601(d.as_secs()))
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());

        Self {
            timestamp,
            event_type,
            result,
            details: None,
        }
    }

    pub fn with_details(mut self, details: AuditDetails) -> Self {
        self.details = Some(details);
        self
    }

    /// Entry for one processed device
    pub fn device_decision(record: &OutcomeRecord) -> Self {
        let result = match (&record.decision, &record.enforcement) {
            (Decision::Allow, _) => AuditResult::Success,
            (Decision::Deny(_), None | Some(EnforcementOutcome::Success)) => AuditResult::Denied,
            (Decision::Deny(_), Some(_)) => AuditResult::Failure,
        };
        Self::new(AuditEventType::DeviceDecision, result)
            .with_details(AuditDetails::Device(record.clone()))
    }
}

/// Convert Unix timestamp to ISO 8601 format
fn time_to_iso8601(secs: u64) -> String {
    const SECONDS_PER_DAY: u64 = 86400;
    const SECONDS_PER_HOUR: u64 = 3600;
    const SECONDS_PER_MINUTE: u64 = 60;

    let days = secs / SECONDS_PER_DAY;
    let remaining = secs % SECONDS_PER_DAY;
    let hours = remaining / SECONDS_PER_HOUR;
    let remaining = remaining % SECONDS_PER_HOUR;
    let minutes = remaining / SECONDS_PER_MINUTE;
    let seconds = remaining % SECONDS_PER_MINUTE;

    let (year, month, day) = days_to_ymd(days);

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year, month, day, hours, minutes, seconds
    )
}

/// Convert days since Unix epoch to year, month, day
fn days_to_ymd(days: u64) -> (u32, u32, u32) {
    let mut remaining_days = days;
    let mut year = 1970u32;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let february = if is_leap_year(year) { 29 } else { 28 };
    let days_in_months = [31, february, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];

    let mut month = 1u32;
    for days_in_month in days_in_months {
        if remaining_days < days_in_month {
            break;
        }
        remaining_days -= days_in_month;
        month += 1;
    }

    (year, month, remaining_days as u32 + 1)
}

fn is_leap_year(year: u32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

/// Message sent to the audit writer
enum AuditMessage {
    Log(AuditEntry),
    Shutdown,
}

/// Async audit logger that writes to a file in the background
pub struct AuditLogger {
    sender: mpsc::UnboundedSender<AuditMessage>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLogger {
    /// Start the background writer
    ///
    /// Returns None if audit logging is disabled. Must be called inside a
    /// tokio runtime.
    pub fn new(config: AuditConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let writer = AuditWriter::new(config);
        let handle = tokio::spawn(writer.run(receiver));

        Some(Self {
            sender,
            writer: Mutex::new(Some(handle)),
        })
    }

    /// Queue an audit entry
    pub fn log(&self, entry: AuditEntry) {
        if self.sender.send(AuditMessage::Log(entry)).is_err() {
            warn!("Audit writer has stopped, dropping entry");
        }
    }

    /// Flush queued entries and stop the writer
    pub async fn shutdown(&self) {
        let _ = self.sender.send(AuditMessage::Shutdown);

        let handle = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Audit writer task failed: {}", e);
            }
        }
    }
}

impl Notifier for AuditLogger {
    fn outcome(&self, record: &OutcomeRecord) {
        self.log(AuditEntry::device_decision(record));
    }

    fn policy_reloaded(&self, path: &Path, result: &common::Result<LoadReport>) {
        let entry = match result {
            Ok(report) => AuditEntry::new(AuditEventType::PolicyReloaded, AuditResult::Success)
                .with_details(AuditDetails::Policy {
                    path: report.path.clone(),
                    entries: Some(report.entries),
                    skipped: Some(report.skipped.len()),
                    error: None,
                }),
            Err(e) => AuditEntry::new(AuditEventType::PolicyReloaded, AuditResult::Failure)
                .with_details(AuditDetails::Policy {
                    path: path.to_path_buf(),
                    entries: None,
                    skipped: None,
                    error: Some(e.to_string()),
                }),
        };
        self.log(entry);
    }

    fn daemon_started(&self, version: &str) {
        self.log(
            AuditEntry::new(AuditEventType::DaemonStarted, AuditResult::Success).with_details(
                AuditDetails::Daemon {
                    version: Some(version.to_string()),
                    reason: None,
                },
            ),
        );
    }

    fn daemon_stopped(&self, reason: &str) {
        self.log(
            AuditEntry::new(AuditEventType::DaemonStopped, AuditResult::Success).with_details(
                AuditDetails::Daemon {
                    version: None,
                    reason: Some(reason.to_string()),
                },
            ),
        );
    }
}

/// Background writer for audit log entries
struct AuditWriter {
    config: AuditConfig,
    file: Option<BufWriter<File>>,
    current_file_size: u64,
}

impl AuditWriter {
    fn new(config: AuditConfig) -> Self {
        Self {
            config,
            file: None,
            current_file_size: 0,
        }
    }

    /// Open or reopen the audit log file
    fn open_file(&mut self) -> Result<()> {
        let path = &self.config.path;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit log directory: {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log: {:?}", path))?;

        self.current_file_size = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.file = Some(BufWriter::new(file));

        debug!("Opened audit log: {:?}", path);
        Ok(())
    }

    fn write_entry(&mut self, entry: &AuditEntry) -> Result<()> {
        if self.file.is_none() {
            self.open_file()?;
        }

        let mut line = serde_json::to_string(entry).context("Failed to serialize audit entry")?;
        line.push('\n');

        if let Some(ref mut writer) = self.file {
            writer
                .write_all(line.as_bytes())
                .context("Failed to write audit entry")?;
            writer.flush().context("Failed to flush audit log")?;
            self.current_file_size += line.len() as u64;

            if self.should_rotate() {
                self.rotate()?;
            }
        }

        Ok(())
    }

    fn should_rotate(&self) -> bool {
        self.config
            .max_size_mb
            .is_some_and(|max_size| self.current_file_size >= u64::from(max_size) * 1024 * 1024)
    }

    /// Shift `audit.log.N` to `audit.log.N+1`, keeping at most `max_files`
    /// rotated files, then start a fresh log
    fn rotate(&mut self) -> Result<()> {
        self.file = None;

        let path = &self.config.path;
        let max_files = self.config.max_files.unwrap_or(5).max(1);

        let oldest = rotated_path(path, max_files);
        if oldest.exists() {
            std::fs::remove_file(&oldest).ok();
        }
        for i in (1..max_files).rev() {
            let old_path = rotated_path(path, i);
            if old_path.exists() {
                std::fs::rename(&old_path, rotated_path(path, i + 1)).ok();
            }
        }

        if path.exists() {
            std::fs::rename(path, rotated_path(path, 1))
                .with_context(|| format!("Failed to rotate audit log: {:?}", path))?;
        }

        debug!("Rotated audit log: {:?}", path);
        self.open_file()
    }

    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<AuditMessage>) {
        while let Some(message) = receiver.recv().await {
            match message {
                AuditMessage::Log(entry) => {
                    if let Err(e) = self.write_entry(&entry) {
                        error!("Failed to write audit log entry: {:#}", e);
                    }
                }
                AuditMessage::Shutdown => {
                    debug!("Audit logger shutting down");
                    break;
                }
            }
        }

        if let Some(ref mut writer) = self.file {
            let _ = writer.flush();
        }
    }
}

/// Path of the `index`-th rotated log file
fn rotated_path(base: &Path, index: u32) -> PathBuf {
    let file_name = base
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("audit.log");

    base.with_file_name(format!("{}.{}", file_name, index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DenyReason, DeviceAction, DeviceEvent};

    fn denied_record(enforcement: Option<EnforcementOutcome>) -> OutcomeRecord {
        OutcomeRecord::new(
            DeviceEvent::new(DeviceAction::Attached, "/devices/usb1/1-2")
                .with_devnode("/dev/bus/usb/001/004")
                .with_identity("1234", "5678", "XYZ"),
            Decision::Deny(DenyReason::NotInAllowList),
            enforcement,
        )
    }

    fn test_config(dir: &Path) -> AuditConfig {
        AuditConfig {
            enabled: true,
            path: dir.join("logs").join("audit.log"),
            max_size_mb: Some(10),
            max_files: Some(2),
        }
    }

    #[test]
    fn test_time_to_iso8601() {
        assert_eq!(time_to_iso8601(0), "1970-01-01T00:00:00Z");
        // 2024-01-01 00:00:00 UTC
        assert_eq!(time_to_iso8601(1704067200), "2024-01-01T00:00:00Z");
        // 2024-02-29 12:34:56 UTC
        assert_eq!(time_to_iso8601(1709210096), "2024-02-29T12:34:56Z");
    }

    #[test]
    fn test_days_to_ymd() {
        assert_eq!(days_to_ymd(0), (1970, 1, 1));
        assert_eq!(days_to_ymd(365), (1971, 1, 1));
        assert_eq!(days_to_ymd(366), (1971, 1, 2));
    }

    #[test]
    fn test_is_leap_year() {
        assert!(!is_leap_year(1970));
        assert!(!is_leap_year(1900));
        assert!(is_leap_year(2000));
        assert!(is_leap_year(2024));
    }

    #[test]
    fn test_rotated_path() {
        let base = PathBuf::from("/var/log/usbwarden/audit.log");
        assert_eq!(
            rotated_path(&base, 1),
            PathBuf::from("/var/log/usbwarden/audit.log.1")
        );
    }

    #[test]
    fn test_device_decision_result() {
        assert_eq!(
            AuditEntry::device_decision(&denied_record(Some(EnforcementOutcome::Success))).result,
            AuditResult::Denied
        );
        assert_eq!(
            AuditEntry::device_decision(&denied_record(Some(
                EnforcementOutcome::GaveUpAfterRetries {
                    last_error: "No such device".to_string()
                }
            )))
            .result,
            AuditResult::Failure
        );
        assert_eq!(
            AuditEntry::device_decision(&denied_record(None)).result,
            AuditResult::Denied
        );
    }

    #[test]
    fn test_rotation_keeps_max_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let path = config.path.clone();
        let mut writer = AuditWriter::new(config);

        for _ in 0..4 {
            writer
                .write_entry(&AuditEntry::device_decision(&denied_record(None)))
                .unwrap();
            writer.rotate().unwrap();
        }

        assert!(rotated_path(&path, 1).exists());
        assert!(rotated_path(&path, 2).exists());
        assert!(!rotated_path(&path, 3).exists());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }

    #[tokio::test]
    async fn test_logger_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let path = config.path.clone();

        let logger = AuditLogger::new(config).unwrap();
        logger.daemon_started("1.0.0");
        logger.outcome(&denied_record(Some(EnforcementOutcome::Success)));
        logger.daemon_stopped("requested");
        logger.shutdown().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event_type"], "daemon_started");
        assert_eq!(lines[1]["event_type"], "device_decision");
        assert_eq!(lines[1]["result"], "denied");
        assert_eq!(lines[1]["details"]["devpath"], "/devices/usb1/1-2");
        assert_eq!(lines[2]["details"]["reason"], "requested");
    }

    #[tokio::test]
    async fn test_failed_reload_names_policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let path = config.path.clone();

        let logger = AuditLogger::new(config).unwrap();
        logger.policy_reloaded(
            Path::new("/etc/usbwarden/allowlist"),
            &Err(common::Error::Policy("No such file or directory".to_string())),
        );
        logger.shutdown().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(content.trim_end()).unwrap();

        assert_eq!(line["event_type"], "policy_reloaded");
        assert_eq!(line["result"], "failure");
        assert_eq!(line["details"]["path"], "/etc/usbwarden/allowlist");
        assert!(
            line["details"]["error"]
                .as_str()
                .unwrap()
                .contains("No such file")
        );
    }

    #[test]
    fn test_disabled_logger() {
        assert!(AuditLogger::new(AuditConfig::default()).is_none());
    }
}
