//! Systemd service integration
//!
//! sd_notify readiness, reload and stop notifications plus the watchdog
//! keepalive. Everything is a no-op when `NOTIFY_SOCKET` is unset.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Send a raw sd_notify message to the socket at `socket_path`
pub fn notify_socket(socket_path: impl AsRef<Path>, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path.as_ref())
        .with_context(|| format!("Failed to send '{}' to systemd", message))?;
    Ok(())
}

fn notify(message: &str) -> Result<()> {
    match env::var("NOTIFY_SOCKET") {
        Ok(socket_path) => {
            notify_socket(socket_path, message)?;
            debug!("Notified systemd: {}", message);
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

/// Monitoring has started
pub fn notify_ready() -> Result<()> {
    notify("READY=1")
}

/// The policy file is being re-read
pub fn notify_reloading() -> Result<()> {
    notify("RELOADING=1")
}

/// The daemon is shutting down
pub fn notify_stopping() -> Result<()> {
    notify("STOPPING=1")
}

pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1")
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    notify(&format!("STATUS={}", status))
}

/// Check if running under systemd
pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Watchdog timeout configured by systemd, in microseconds
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

/// Keepalive interval for a watchdog timeout: half of it, at least a second
fn watchdog_interval(timeout_usec: u64) -> Duration {
    Duration::from_secs((timeout_usec / 1_000_000 / 2).max(1))
}

/// Spawn the watchdog keepalive task
///
/// Returns None when systemd has not enabled the watchdog. Abort the handle
/// on shutdown.
pub fn spawn_watchdog_task() -> Option<JoinHandle<()>> {
    let Some(timeout_usec) = get_watchdog_timeout() else {
        debug!("Systemd watchdog not enabled");
        return None;
    };

    let interval = watchdog_interval(timeout_usec);
    info!(
        "Systemd watchdog enabled, interval: {}s (timeout: {}s)",
        interval.as_secs(),
        timeout_usec / 1_000_000
    );

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}
