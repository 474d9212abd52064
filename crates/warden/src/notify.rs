//! Outcome notifiers
//!
//! The control loop reports one [`OutcomeRecord`] per processed device and a
//! result for every policy reload. How that is rendered (log lines, audit
//! records) is up to the notifier.

use crate::policy::LoadReport;
use common::{Decision, EnforcementOutcome, OutcomeRecord, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Consumer of authorization outcomes
pub trait Notifier: Send + Sync {
    /// Called once for every processed device event
    fn outcome(&self, record: &OutcomeRecord);

    /// Called after every attempt to reload the policy file at `path`
    fn policy_reloaded(&self, _path: &Path, _result: &Result<LoadReport>) {}

    /// Called once monitoring starts
    fn daemon_started(&self, _version: &str) {}

    /// Called once monitoring stops
    fn daemon_stopped(&self, _reason: &str) {}
}

impl<T: Notifier + ?Sized> Notifier for Arc<T> {
    fn outcome(&self, record: &OutcomeRecord) {
        (**self).outcome(record)
    }

    fn policy_reloaded(&self, path: &Path, result: &Result<LoadReport>) {
        (**self).policy_reloaded(path, result)
    }

    fn daemon_started(&self, version: &str) {
        (**self).daemon_started(version)
    }

    fn daemon_stopped(&self, reason: &str) {
        (**self).daemon_stopped(reason)
    }
}

impl Notifier for Vec<Box<dyn Notifier>> {
    fn outcome(&self, record: &OutcomeRecord) {
        for notifier in self {
            notifier.outcome(record);
        }
    }

    fn policy_reloaded(&self, path: &Path, result: &Result<LoadReport>) {
        for notifier in self {
            notifier.policy_reloaded(path, result);
        }
    }

    fn daemon_started(&self, version: &str) {
        for notifier in self {
            notifier.daemon_started(version);
        }
    }

    fn daemon_stopped(&self, reason: &str) {
        for notifier in self {
            notifier.daemon_stopped(reason);
        }
    }
}

/// Renders outcomes as tracing events
///
/// Abandoned unbinds are logged at `error` so they stand out from ordinary
/// denials.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn outcome(&self, record: &OutcomeRecord) {
        let device = record.devnode.as_deref().unwrap_or(&record.devpath);
        let identity = record.identity_label();

        match (&record.decision, &record.enforcement) {
            (Decision::Allow, _) => {
                info!("Allowed {} device {} ({})", record.action, device, identity);
            }
            (Decision::Deny(_), None) => {
                info!(
                    "{} {} device {} ({}), nothing to enforce",
                    record.decision, record.action, device, identity
                );
            }
            (Decision::Deny(_), Some(EnforcementOutcome::Success)) => {
                warn!(
                    "Blocked {} device {} ({}): {}",
                    record.action, device, identity, record.decision
                );
            }
            (Decision::Deny(_), Some(outcome)) => {
                error!(
                    "Unauthorized {} device {} ({}) still bound: {}",
                    record.action, device, identity, outcome
                );
            }
        }
    }

    fn policy_reloaded(&self, path: &Path, result: &Result<LoadReport>) {
        match result {
            Ok(report) if report.skipped.is_empty() => info!(
                "Policy reloaded: {} entries from {}",
                report.entries,
                report.path.display()
            ),
            Ok(report) => warn!(
                "Policy reloaded with {} malformed line(s) skipped: {} entries from {}",
                report.skipped.len(),
                report.entries,
                report.path.display()
            ),
            Err(e) => error!(
                "Reload of {} failed, keeping previous allow-list: {}",
                path.display(),
                e
            ),
        }
    }

    fn daemon_started(&self, version: &str) {
        info!("usbwarden v{} monitoring USB devices", version);
    }

    fn daemon_stopped(&self, reason: &str) {
        info!("usbwarden stopped: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{DeviceAction, DeviceEvent};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        outcomes: Mutex<Vec<OutcomeRecord>>,
        reloads: Mutex<usize>,
    }

    impl Notifier for Recorder {
        fn outcome(&self, record: &OutcomeRecord) {
            self.outcomes.lock().unwrap().push(record.clone());
        }

        fn policy_reloaded(&self, _path: &Path, _result: &Result<LoadReport>) {
            *self.reloads.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_fanout_reaches_every_notifier() {
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let fanout: Vec<Box<dyn Notifier>> = vec![
            Box::new(Arc::clone(&first)),
            Box::new(Arc::clone(&second)),
            Box::new(LogNotifier),
        ];

        let record = OutcomeRecord::new(
            DeviceEvent::new(DeviceAction::Attached, "/devices/usb1/1-1"),
            Decision::Allow,
            None,
        );
        fanout.outcome(&record);
        fanout.policy_reloaded(
            Path::new("/etc/usbwarden/allowlist"),
            &Err(common::Error::Policy("gone".to_string())),
        );

        assert_eq!(first.outcomes.lock().unwrap().as_slice(), &[record.clone()]);
        assert_eq!(second.outcomes.lock().unwrap().as_slice(), &[record]);
        assert_eq!(*first.reloads.lock().unwrap(), 1);
        assert_eq!(*second.reloads.lock().unwrap(), 1);
    }
}
