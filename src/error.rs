use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that may occur in this library.
#[derive(Debug, Error)]
pub enum Error {
    /// A serial device could not be opened.
    #[error("cannot open {path}: {source}")]
    OpenFailed {
        /// The device that failed to open.
        path: PathBuf,
        /// The underlying cause.
        source: io::Error,
    },

    /// A serial device was opened but could not be put into raw mode.
    #[error("cannot configure {path}: {source}")]
    ConfigureFailed {
        /// The device that failed to configure.
        path: PathBuf,
        /// The underlying cause.
        source: io::Error,
    },

    /// A file descriptor could not be registered with the event loop.
    #[error("cannot register {path} with the event loop: {source}")]
    RegisterFailed {
        /// The device whose descriptor failed to register.
        path: PathBuf,
        /// The underlying cause.
        source: io::Error,
    },

    /// Another daemon instance already owns the pid file.
    #[error("daemon already running (pid {pid})")]
    AlreadyRunning {
        /// The pid recorded in the pid file.
        pid: i32,
    },

    /// The session directory could not be created.
    #[error("cannot create session {path}: {source}")]
    SessionCreateFailed {
        /// The session directory that failed.
        path: PathBuf,
        /// The underlying cause.
        source: io::Error,
    },

    /// A per-port log file could not be opened.
    #[error("cannot open log {path}: {source}")]
    LogOpenFailed {
        /// The log file that failed to open.
        path: PathBuf,
        /// The underlying cause.
        source: io::Error,
    },

    /// A port with the same device path is already monitored.
    #[error("already monitoring {dev_path}")]
    Duplicate {
        /// The duplicate device path.
        dev_path: String,
    },

    /// The device filter excludes this port.
    #[error("{dev_path} excluded by device filter")]
    FilterExcluded {
        /// The excluded device path.
        dev_path: String,
    },

    /// No monitored port matches the given device path.
    #[error("port not found: {dev_path}")]
    PortNotFound {
        /// The device path that was looked up.
        dev_path: String,
    },

    /// The port table is full.
    #[error("port table full")]
    PortTableFull,

    /// The tty has no identifiable USB device behind it in sysfs.
    #[error("{dev_path} has no sysfs identity (virtual tty?)")]
    NotIdentified {
        /// The device path that could not be identified.
        dev_path: String,
    },

    /// An ambient I/O problem.
    #[error(transparent)]
    Io(#[from] io::Error),
}
