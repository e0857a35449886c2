#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Administrative command socket: the daemon side and the client helpers.
pub mod control;

/// The static catalog of known USB serial adapters.
pub mod devices;

/// Possible errors in this library.
pub mod error;

/// Hot-plug notifications for tty devices.
///
/// Netlink uevents when available, an inotify watch on /dev otherwise.
pub mod hotplug;

/// Walks sysfs to figure out which physical board a tty belongs to.
pub mod identify;

/// Per-port log files with timestamped lines.
pub mod logfile;

/// Logging/tracing setup.
pub mod logging;

/// The monitoring daemon: the event loop and the port table.
pub mod monitor;

/// Serial port handles.
pub mod serial;

/// Session directories under the base directory.
pub mod session;

/// The status snapshot published for other tools.
pub mod status;
