//! usbwarden
//!
//! USB device authorization daemon. Every USB device that appears on the
//! host is checked against an allow-list of serial/vendor/product records;
//! devices that are not listed are unbound from their driver.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use warden::audit::AuditLogger;
use warden::config::WardenConfig;
use warden::enforcement::check_privilege;
use warden::guard::{control_channel, spawn_signal_listener};
use warden::{
    AllowList, DeviceTracker, Enforcer, Guard, LogNotifier, Notifier, PolicyStore,
    SysfsUnbind, UeventMonitor, decide, service,
};

#[derive(Parser, Debug)]
#[command(name = "usbwarden")]
#[command(author, version, about = "USB device authorization daemon")]
#[command(long_about = "
Monitors USB hotplug events and unbinds every device whose serial number,
vendor id and product id are not listed in the allow-list.

EXAMPLES:
    # Run with default config
    usbwarden

    # Validate an allow-list without starting the daemon
    usbwarden --check-policy --policy /etc/usbwarden/allowlist

    # Show what would happen to the devices plugged in right now
    usbwarden --list-devices

    # Log denials without unbinding anything
    usbwarden --dry-run --log-level debug

SIGNALS:
    SIGHUP           Re-read the allow-list
    SIGTERM, SIGINT  Stop monitoring and exit

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbwarden/warden.toml
    3. /etc/usbwarden/warden.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Allow-list file, overrides the configured path
    #[arg(short, long, value_name = "PATH")]
    policy: Option<PathBuf>,

    /// Parse the allow-list, report what was loaded and exit
    #[arg(long)]
    check_policy: bool,

    /// List connected USB devices with the decision each would get and exit
    #[arg(long)]
    list_devices: bool,

    /// Log denials instead of unbinding
    #[arg(long)]
    dry_run: bool,

    /// Run as systemd service (readiness and watchdog notifications)
    #[arg(long)]
    service: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = WardenConfig::default();
        let path = WardenConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        WardenConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        WardenConfig::load_or_default()
    };

    if let Some(policy) = args.policy {
        config.policy.path = policy;
    }
    config.enforcement.dry_run |= args.dry_run;
    config.daemon.service_mode |= args.service;

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usbwarden v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.check_policy {
        return check_policy_mode(&config);
    }

    let (policy, report) = PolicyStore::load(&config.policy.path, config.policy.id_format);
    if let Err(e) = report {
        warn!("{}; starting with an empty allow-list, every device will be denied", e);
    }

    let tracker = DeviceTracker::new(&config.monitor.sysfs_root, config.monitor.skip_root_hubs);

    if args.list_devices {
        return list_devices_mode(tracker, &policy.snapshot());
    }

    run_daemon(config, policy, tracker).await
}

/// Parse the allow-list and print what was loaded
fn check_policy_mode(config: &WardenConfig) -> Result<()> {
    let (store, report) = PolicyStore::load(&config.policy.path, config.policy.id_format);
    let report = report.context("Policy check failed")?;

    println!(
        "{}: {} entries, {} skipped line(s)\n",
        report.path.display(),
        report.entries,
        report.skipped.len()
    );
    for entry in store.snapshot().entries() {
        println!("  {}", entry);
    }
    if !report.skipped.is_empty() {
        println!("\nSkipped:");
        for line in &report.skipped {
            println!("  line {}: {} ({})", line.line_number, line.content, line.reason);
        }
    }

    Ok(())
}

/// Enumerate connected devices and print the decision each would get
fn list_devices_mode(mut tracker: DeviceTracker, policy: &AllowList) -> Result<()> {
    let devices = tracker
        .enumerate()
        .context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} - {}",
            device.devnode.as_deref().unwrap_or("-"),
            decide(&device, policy)
        );
        println!("      {}", device.identity_label());
        println!("      {}", device.devpath);
    }

    Ok(())
}

/// Monitor until SIGTERM/SIGINT or until the event source ends
async fn run_daemon(
    config: WardenConfig,
    policy: PolicyStore,
    tracker: DeviceTracker,
) -> Result<()> {
    let dry_run = config.enforcement.dry_run;
    if dry_run {
        warn!("Dry run: denied devices will be logged, not unbound");
    } else {
        check_privilege(&config.enforcement.unbind_path)
            .context("Cannot enforce USB authorization")?;
    }

    let enforcer = Enforcer::new(SysfsUnbind::new(&config.enforcement.unbind_path))
        .with_dry_run(dry_run);

    let (signal_tx, signal_rx) = control_channel();
    let signal_listener =
        spawn_signal_listener(signal_tx).context("Failed to install signal handlers")?;

    let monitor = UeventMonitor::open(tracker, config.monitor.enumerate_existing)
        .context("Failed to start USB hotplug monitor")?;

    let audit = AuditLogger::new(config.audit.clone()).map(Arc::new);
    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogNotifier)];
    if let Some(ref audit) = audit {
        info!("Audit log: {}", config.audit.path.display());
        notifiers.push(Box::new(Arc::clone(audit)));
    }

    let watchdog = if config.daemon.service_mode || service::is_systemd() {
        info!("Running as systemd service");
        service::spawn_watchdog_task()
    } else {
        None
    };

    if let Err(e) = service::notify_ready() {
        warn!("Failed to notify systemd: {:#}", e);
    }

    let guard = Guard::new(monitor, policy, enforcer, Box::new(notifiers));
    let reason = guard.run(signal_rx).await;

    if let Err(e) = service::notify_stopping() {
        warn!("Failed to notify systemd: {:#}", e);
    }
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }
    signal_listener.abort();

    if let Some(audit) = audit {
        audit.shutdown().await;
    }

    if let warden::ShutdownReason::SourceFailed(ref e) = reason {
        error!("Hotplug monitoring failed: {}", e);
    }
    info!("usbwarden shutdown complete");
    Ok(())
}
