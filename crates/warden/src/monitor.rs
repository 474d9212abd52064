//! Device event source
//!
//! Listens for kernel uevents on a netlink socket, keeps only USB devices that
//! have a device node, and attaches the identity attributes read from sysfs.
//! Devices already present at start-up are reported first as `Existing`.

use async_trait::async_trait;
use common::types::bus_address_token;
use common::{DeviceAction, DeviceEvent, Error, Result};
use kobject_uevent::{ActionType, UEvent};
use nix::errno::Errno;
use nix::sys::socket;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use tokio::io::unix::AsyncFd;
use tracing::{debug, info, trace, warn};

/// Kernel uevent multicast group
const KERNEL_UEVENT_GROUP: u32 = 1;

/// Socket receive buffer. Enforcement blocks event processing, so bursts of
/// hotplug events queue up in the kernel while a device is being unbound.
const UEVENT_RCVBUF_SIZE: usize = 1024 * 1024;

/// A single uevent message never exceeds the kernel's 2 KiB env buffer
const UEVENT_MSG_SIZE: usize = 8 * 1024;

/// Source of device events for the control loop
#[async_trait]
pub trait EventSource: Send {
    /// Wait for the next device event
    ///
    /// `Ok(None)` marks the end of the stream.
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Identity {
    vendor_id: Option<String>,
    product_id: Option<String>,
    serial: Option<String>,
}

/// Turns raw hotplug notifications into [`DeviceEvent`]s
///
/// Remembers the identity read when a device appeared so the matching
/// removal can be described after sysfs has dropped its attributes.
#[derive(Debug)]
pub struct DeviceTracker {
    sysfs_root: PathBuf,
    skip_root_hubs: bool,
    identities: HashMap<String, Identity>,
}

impl DeviceTracker {
    pub fn new(sysfs_root: impl Into<PathBuf>, skip_root_hubs: bool) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            skip_root_hubs,
            identities: HashMap::new(),
        }
    }

    /// Build an event for a USB device notification
    ///
    /// Returns `None` for notifications without a device node and, when
    /// configured, for root hubs.
    pub fn observe(
        &mut self,
        action: DeviceAction,
        devpath: &str,
        devname: Option<&str>,
    ) -> Option<DeviceEvent> {
        let devname = devname.filter(|name| !name.is_empty())?;

        if self.skip_root_hubs && is_root_hub(devpath) {
            trace!("Skipping root hub {}", devpath);
            return None;
        }

        let mut event = DeviceEvent::new(action, devpath).with_devnode(devnode_path(devname));

        let identity = if action.is_present() {
            let identity = self.read_identity(devpath);
            self.identities
                .insert(devpath.to_string(), identity.clone());
            identity
        } else {
            self.identities.remove(devpath).unwrap_or_default()
        };

        event.vendor_id = identity.vendor_id;
        event.product_id = identity.product_id;
        event.serial = identity.serial;
        Some(event)
    }

    /// Translate a kernel uevent
    pub fn observe_uevent(&mut self, uevent: &UEvent) -> Option<DeviceEvent> {
        if uevent.subsystem != "usb" {
            return None;
        }

        let action = match uevent.action {
            ActionType::Add => DeviceAction::Attached,
            ActionType::Remove => DeviceAction::Detached,
            _ => return None,
        };

        let devpath = uevent.devpath.to_string_lossy();
        self.observe(
            action,
            &devpath,
            uevent.env.get("DEVNAME").map(String::as_str),
        )
    }

    /// List USB devices already present, parents first
    pub fn enumerate(&mut self) -> Result<Vec<DeviceEvent>> {
        let root = fs::canonicalize(&self.sysfs_root).map_err(|e| {
            Error::Monitor(format!(
                "Cannot resolve sysfs root {}: {}",
                self.sysfs_root.display(),
                e
            ))
        })?;
        let devices_dir = root.join("bus/usb/devices");
        let entries = fs::read_dir(&devices_dir).map_err(|e| {
            Error::Monitor(format!("Cannot list {}: {}", devices_dir.display(), e))
        })?;

        let mut found = Vec::new();
        for entry in entries {
            let link = entry?.path();
            let target = match fs::canonicalize(&link) {
                Ok(target) => target,
                Err(e) => {
                    debug!("Cannot resolve {}: {}", link.display(), e);
                    continue;
                }
            };
            let Ok(relative) = target.strip_prefix(&root) else {
                debug!("{} resolves outside sysfs", link.display());
                continue;
            };
            let devpath = format!("/{}", relative.display());
            let devname = read_uevent_var(&target.join("uevent"), "DEVNAME");
            found.push((devpath, devname));
        }
        found.sort();

        Ok(found
            .into_iter()
            .filter_map(|(devpath, devname)| {
                self.observe(DeviceAction::Existing, &devpath, devname.as_deref())
            })
            .collect())
    }

    fn read_identity(&self, devpath: &str) -> Identity {
        Identity {
            vendor_id: self.read_attribute(devpath, "idVendor"),
            product_id: self.read_attribute(devpath, "idProduct"),
            serial: self.read_attribute(devpath, "serial"),
        }
    }

    fn read_attribute(&self, devpath: &str, name: &str) -> Option<String> {
        let path = self
            .sysfs_root
            .join(devpath.trim_start_matches('/'))
            .join(name);
        match fs::read_to_string(&path) {
            Ok(value) => Some(value.trim_end_matches('\n').to_string()),
            Err(e) => {
                trace!("{} unavailable: {}", path.display(), e);
                None
            }
        }
    }
}

fn devnode_path(devname: &str) -> String {
    if devname.starts_with('/') {
        devname.to_string()
    } else {
        format!("/dev/{}", devname)
    }
}

fn is_root_hub(devpath: &str) -> bool {
    bus_address_token(devpath).is_some_and(|token| token.starts_with("usb"))
}

fn read_uevent_var(path: &Path, key: &str) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string)
    })
}

fn create_socket() -> Result<OwnedFd> {
    let monitor_err = |what: &str, e: Errno| Error::Monitor(format!("{}: {}", what, e));

    let addr = socket::NetlinkAddr::new(0, KERNEL_UEVENT_GROUP);
    let s = socket::socket(
        socket::AddressFamily::Netlink,
        socket::SockType::Datagram,
        socket::SockFlag::SOCK_NONBLOCK | socket::SockFlag::SOCK_CLOEXEC,
        socket::SockProtocol::NetlinkKObjectUEvent,
    )
    .map_err(|e| monitor_err("Cannot create uevent socket", e))?;
    socket::setsockopt(&s, socket::sockopt::RcvBuf, &UEVENT_RCVBUF_SIZE)
        .map_err(|e| monitor_err("Cannot size uevent socket buffer", e))?;
    socket::bind(s.as_raw_fd(), &addr)
        .map_err(|e| monitor_err("Cannot bind uevent socket", e))?;

    Ok(s)
}

/// Hotplug monitor backed by the kernel's netlink uevent channel
pub struct UeventMonitor {
    socket: AsyncFd<OwnedFd>,
    buffer: Vec<u8>,
    tracker: DeviceTracker,
    pending: VecDeque<DeviceEvent>,
}

impl UeventMonitor {
    /// Subscribe to kernel uevents
    ///
    /// The subscription is made before enumerating present devices so that
    /// nothing plugged in during start-up is missed.
    pub fn open(tracker: DeviceTracker, enumerate_existing: bool) -> Result<Self> {
        let monitor = Self::from_socket(create_socket()?, tracker, enumerate_existing)?;
        info!("Monitoring USB hotplug events");
        Ok(monitor)
    }

    /// Read uevent packets from an already bound datagram socket
    fn from_socket(
        socket: OwnedFd,
        tracker: DeviceTracker,
        enumerate_existing: bool,
    ) -> Result<Self> {
        let mut monitor = Self {
            socket: AsyncFd::new(socket)?,
            buffer: vec![0u8; UEVENT_MSG_SIZE],
            tracker,
            pending: VecDeque::new(),
        };

        if enumerate_existing {
            monitor.resynchronize()?;
        }
        Ok(monitor)
    }

    fn resynchronize(&mut self) -> Result<()> {
        let existing = self.tracker.enumerate()?;
        info!("Found {} USB device(s) already connected", existing.len());
        self.pending.extend(existing);
        Ok(())
    }

    /// Wait for and parse one uevent
    async fn recv_uevent(&mut self) -> Result<Received> {
        loop {
            let received = {
                let mut guard = self.socket.readable().await?;
                match guard.try_io(|inner| {
                    socket::recv(
                        inner.as_raw_fd(),
                        &mut self.buffer,
                        socket::MsgFlags::empty(),
                    )
                    .map_err(io::Error::from)
                }) {
                    Ok(result) => result,
                    Err(_would_block) => continue,
                }
            };

            match received {
                Ok(0) => {
                    return Err(Error::Monitor(
                        "netlink socket returned 0 bytes".to_string(),
                    ));
                }
                Ok(count) => match UEvent::from_netlink_packet(&self.buffer[..count]) {
                    Ok(uevent) => return Ok(Received::Uevent(uevent)),
                    Err(e) => debug!("Ignoring malformed uevent: {}", e),
                },
                Err(e) if e.raw_os_error() == Some(Errno::ENOBUFS as i32) => {
                    // Events were dropped; rescan so no attached device goes unseen
                    warn!("Uevent queue overflowed, rescanning connected devices");
                    self.resynchronize()?;
                    return Ok(Received::Resynchronized);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

enum Received {
    Uevent(UEvent),
    Resynchronized,
}

#[async_trait]
impl EventSource for UeventMonitor {
    async fn next_event(&mut self) -> Result<Option<DeviceEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }

            match self.recv_uevent().await? {
                Received::Uevent(uevent) => {
                    if let Some(event) = self.tracker.observe_uevent(&uevent) {
                        return Ok(Some(event));
                    }
                }
                Received::Resynchronized => {}
            }
        }
    }
}
