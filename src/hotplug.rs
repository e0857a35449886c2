use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tracing::warn;

use crate::error::Error;

/// What happened to a tty device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// The device node appeared.
    Add,
    /// The device node went away.
    Remove,
}

/// One tty appearance or disappearance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotplugEvent {
    /// What happened.
    pub action: HotplugAction,
    /// The bare device name, e.g. `ttyUSB0`.
    pub devname: String,
    /// The device node path, e.g. `/dev/ttyUSB0`.
    pub devpath: PathBuf,
}

enum Backend {
    /// Kernel uevent multicast socket.
    Netlink(OwnedFd),
    /// Watching `/dev` for node creation/deletion.
    Inotify(Inotify),
}

/// A non-blocking source of tty hot-plug events.
///
/// Prefers the kernel uevent netlink socket; falls back to an inotify
/// watch on `/dev` when the socket cannot be set up (e.g. in containers
/// without netlink access).
pub struct Hotplug {
    backend: Backend,
}

/// Whether a device name belongs to a tty family we monitor.
pub fn is_monitored_tty(devname: &str) -> bool {
    devname.starts_with("ttyUSB") || devname.starts_with("ttyACM") || devname.starts_with("ttyUART")
}

/// Parse one uevent datagram: NUL-separated `KEY=VALUE` strings.
///
/// Only `add`/`remove` actions on monitored tty names pass the filter.
fn parse_uevent(buf: &[u8]) -> Option<HotplugEvent> {
    let mut action = "";
    let mut subsystem = "";
    let mut devname = "";

    for chunk in buf.split(|&b| b == 0) {
        let Ok(text) = std::str::from_utf8(chunk) else {
            continue;
        };

        if let Some(value) = text.strip_prefix("ACTION=") {
            action = value;
        } else if let Some(value) = text.strip_prefix("SUBSYSTEM=") {
            subsystem = value;
        } else if let Some(value) = text.strip_prefix("DEVNAME=") {
            devname = value;
        }
    }

    if subsystem != "tty" || !is_monitored_tty(devname) {
        return None;
    }

    let action = match action {
        "add" => HotplugAction::Add,
        "remove" => HotplugAction::Remove,
        _ => return None,
    };

    Some(HotplugEvent {
        action,
        devname: devname.to_string(),
        devpath: PathBuf::from(format!("/dev/{devname}")),
    })
}

fn try_netlink() -> nix::Result<OwnedFd> {
    let fd = socket(
        AddressFamily::Netlink,
        SockType::Datagram,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        SockProtocol::NetlinkKObjectUEvent,
    )?;

    // Group 1 is the kernel uevent multicast group.
    let addr = NetlinkAddr::new(std::process::id(), 1);
    bind(fd.as_raw_fd(), &addr)?;

    Ok(fd)
}

fn try_inotify() -> nix::Result<Inotify> {
    let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
    inotify.add_watch("/dev", AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE)?;
    Ok(inotify)
}

impl Hotplug {
    /// Set up the hot-plug source, preferring netlink.
    pub fn new() -> Result<Self, Error> {
        match try_netlink() {
            Ok(fd) => {
                return Ok(Self {
                    backend: Backend::Netlink(fd),
                })
            }
            Err(errno) => {
                warn!(%errno, "Netlink uevent socket failed, falling back to inotify");
            }
        }

        let inotify = try_inotify().map_err(|errno| Error::RegisterFailed {
            path: PathBuf::from("/dev"),
            source: io::Error::from(errno),
        })?;

        Ok(Self {
            backend: Backend::Inotify(inotify),
        })
    }

    /// The descriptor to wait for readiness on.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.backend {
            Backend::Netlink(fd) => fd.as_fd(),
            Backend::Inotify(inotify) => inotify.as_fd(),
        }
    }

    /// Drain one notification.
    ///
    /// Returns `Ok(None)` for traffic that does not concern monitored
    /// ttys (the caller simply re-arms readiness).
    pub fn read(&self) -> Result<Option<HotplugEvent>, Error> {
        match &self.backend {
            Backend::Netlink(fd) => {
                let mut buf = [0u8; 8192];
                match recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()) {
                    Ok(0) => Ok(None),
                    Ok(n) => Ok(parse_uevent(&buf[..n])),
                    Err(Errno::EAGAIN) => Ok(None),
                    Err(errno) => Err(Error::Io(io::Error::from(errno))),
                }
            }
            Backend::Inotify(inotify) => {
                let events = match inotify.read_events() {
                    Ok(events) => events,
                    Err(Errno::EAGAIN) => return Ok(None),
                    Err(errno) => return Err(Error::Io(io::Error::from(errno))),
                };

                for event in events {
                    let Some(name) = event.name.as_ref().map(|n| n.to_string_lossy()) else {
                        continue;
                    };

                    if !is_monitored_tty(&name) {
                        continue;
                    }

                    let action = if event.mask.contains(AddWatchFlags::IN_CREATE) {
                        HotplugAction::Add
                    } else if event.mask.contains(AddWatchFlags::IN_DELETE) {
                        HotplugAction::Remove
                    } else {
                        continue;
                    };

                    return Ok(Some(HotplugEvent {
                        action,
                        devname: name.to_string(),
                        devpath: PathBuf::from(format!("/dev/{name}")),
                    }));
                }

                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(parts: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        for part in parts {
            buf.extend_from_slice(part.as_bytes());
            buf.push(0);
        }
        buf
    }

    #[test]
    fn monitored_tty_names() {
        assert!(is_monitored_tty("ttyUSB0"));
        assert!(is_monitored_tty("ttyACM3"));
        assert!(is_monitored_tty("ttyUART1"));
        assert!(!is_monitored_tty("ttyS0"));
        assert!(!is_monitored_tty("sda1"));
    }

    #[test]
    fn uevent_add_for_tty() {
        let buf = datagram(&[
            "add@/devices/pci0000:00/usb1/1-6/1-6:1.0/ttyUSB0",
            "ACTION=add",
            "SUBSYSTEM=tty",
            "DEVNAME=ttyUSB0",
            "SEQNUM=1234",
        ]);

        let event = parse_uevent(&buf).unwrap();

        assert_eq!(event.action, HotplugAction::Add);
        assert_eq!(event.devname, "ttyUSB0");
        assert_eq!(event.devpath, PathBuf::from("/dev/ttyUSB0"));
    }

    #[test]
    fn uevent_remove_for_tty() {
        let buf = datagram(&["ACTION=remove", "SUBSYSTEM=tty", "DEVNAME=ttyACM0"]);

        let event = parse_uevent(&buf).unwrap();

        assert_eq!(event.action, HotplugAction::Remove);
        assert_eq!(event.devname, "ttyACM0");
    }

    #[test]
    fn uevent_other_subsystem_is_ignored() {
        let buf = datagram(&["ACTION=add", "SUBSYSTEM=block", "DEVNAME=sda1"]);

        assert!(parse_uevent(&buf).is_none());
    }

    #[test]
    fn uevent_unmonitored_tty_is_ignored() {
        let buf = datagram(&["ACTION=add", "SUBSYSTEM=tty", "DEVNAME=ttyS0"]);

        assert!(parse_uevent(&buf).is_none());
    }

    #[test]
    fn uevent_bind_action_is_ignored() {
        let buf = datagram(&["ACTION=bind", "SUBSYSTEM=tty", "DEVNAME=ttyUSB0"]);

        assert!(parse_uevent(&buf).is_none());
    }
}
