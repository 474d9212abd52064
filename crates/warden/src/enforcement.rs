//! Enforcement actuator
//!
//! Severs a denied device from its kernel driver by writing its bus-address
//! token to the USB driver unbind file. Each write runs on a blocking worker
//! and is awaited, with a fixed number of attempts before giving up.

use common::types::bus_address_token;
use common::{EnforcementOutcome, Error, Result};
use nix::unistd::{AccessFlags, Uid};
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

/// Total write attempts per enforcement, including the first
pub const MAX_UNBIND_ATTEMPTS: u32 = 5;

/// Writable kernel control interface for unbinding
pub trait UnbindControl: Send + Sync {
    /// Open the interface write-only
    fn open(&self) -> io::Result<Box<dyn Write + Send>>;

    /// Human-readable location, for log lines
    fn describe(&self) -> String;
}

/// The sysfs `unbind` attribute of the generic USB driver
#[derive(Debug, Clone)]
pub struct SysfsUnbind {
    path: PathBuf,
}

impl SysfsUnbind {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl UnbindControl for SysfsUnbind {
    fn open(&self) -> io::Result<Box<dyn Write + Send>> {
        let file = OpenOptions::new().write(true).open(&self.path)?;
        Ok(Box::new(file))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Performs unbinds against an [`UnbindControl`]
pub struct Enforcer<C> {
    control: C,
    dry_run: bool,
}

impl<C: UnbindControl> Enforcer<C> {
    pub fn new(control: C) -> Self {
        Self {
            control,
            dry_run: false,
        }
    }

    /// Log instead of writing
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Unbind the device at `devpath`
    ///
    /// An open failure is returned immediately; write failures are retried
    /// until [`MAX_UNBIND_ATTEMPTS`] writes have been made.
    pub async fn enforce(&self, devpath: &str) -> EnforcementOutcome {
        if self.dry_run {
            warn!("DRY RUN: would unbind {}", devpath);
            return EnforcementOutcome::Success;
        }

        let sink = match self.control.open() {
            Ok(sink) => sink,
            Err(e) => {
                error!("Cannot open {}: {}", self.control.describe(), e);
                return EnforcementOutcome::Failed(format!(
                    "cannot open {}: {}",
                    self.control.describe(),
                    e
                ));
            }
        };

        let Some(token) = bus_address_token(devpath) else {
            return EnforcementOutcome::Failed(format!("no bus-address token in '{}'", devpath));
        };

        let mut payload = token.as_bytes().to_vec();
        payload.push(0);

        let sink = Arc::new(Mutex::new(sink));
        let mut last_error = String::new();

        for attempt in 1..=MAX_UNBIND_ATTEMPTS {
            match submit_write(Arc::clone(&sink), payload.clone()).await {
                Ok(()) => {
                    info!("Unbound {} (attempt {})", token, attempt);
                    return EnforcementOutcome::Success;
                }
                Err(e) => {
                    warn!(
                        "Unbind of {} failed (attempt {}/{}): {}",
                        token, attempt, MAX_UNBIND_ATTEMPTS, e
                    );
                    last_error = e;
                }
            }
        }

        error!(
            "Giving up on unbinding {} after {} attempts",
            token, MAX_UNBIND_ATTEMPTS
        );
        EnforcementOutcome::GaveUpAfterRetries { last_error }
    }
}

/// Write the payload on a blocking worker and wait for it to finish
async fn submit_write(
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
    payload: Vec<u8>,
) -> std::result::Result<(), String> {
    let completion = tokio::task::spawn_blocking(move || {
        let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
        sink.write_all(&payload)?;
        sink.flush()
    });

    match completion.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("write task failed: {}", e)),
    }
}

/// Refuse to enforce without root
///
/// Also warns when the unbind interface is not writable, which usually means
/// sysfs is not mounted where configured.
pub fn check_privilege(unbind_path: &Path) -> Result<()> {
    ensure_root(nix::unistd::geteuid())?;

    if let Err(e) = nix::unistd::access(unbind_path, AccessFlags::W_OK) {
        warn!(
            "Unbind interface {} is not writable: {}",
            unbind_path.display(),
            e
        );
    } else {
        debug!("Unbind interface {} is writable", unbind_path.display());
    }

    Ok(())
}

fn ensure_root(euid: Uid) -> Result<()> {
    if euid.is_root() {
        Ok(())
    } else {
        Err(Error::Privilege(format!(
            "effective uid {} cannot unbind USB devices, run as root",
            euid
        )))
    }
}
