use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::openpty;
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags,
    LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices,
};
use nix::unistd::ttyname;
use tracing::warn;

use crate::error::Error;

mod ioctl {
    nix::ioctl_none_bad!(tiocexcl, libc::TIOCEXCL);
}

/// An open serial device configured for raw 8N1 reads.
///
/// In proxy mode the handle additionally owns a PTY pair whose slave side
/// is published to clients while the master side is forwarded by the
/// monitor.
#[derive(Debug)]
pub struct SerialPort {
    path: PathBuf,
    fd: Option<OwnedFd>,
    pty_master: Option<OwnedFd>,
    // Held open so the master side stays connected even with no client
    // on the slave path.
    pty_slave: Option<OwnedFd>,
    pty_slave_path: Option<PathBuf>,
}

/// Map a numeric baud rate onto the termios constant.
/// Unrecognized rates fall back to 115200.
pub fn baud_to_speed(baud: u32) -> BaudRate {
    match baud {
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        460_800 => BaudRate::B460800,
        921_600 => BaudRate::B921600,
        1_000_000 => BaudRate::B1000000,
        1_500_000 => BaudRate::B1500000,
        2_000_000 => BaudRate::B2000000,
        3_000_000 => BaudRate::B3000000,
        4_000_000 => BaudRate::B4000000,
        _ => BaudRate::B115200,
    }
}

/// Put a descriptor into raw 8N1 mode at the given speed.
///
/// All input, output and local processing is cleared; `VMIN`/`VTIME` are
/// zero so reads never block.
fn configure_raw(fd: BorrowedFd<'_>, speed: BaudRate) -> nix::Result<()> {
    let mut tty = tcgetattr(fd)?;

    tty.input_flags = InputFlags::empty();
    tty.output_flags = OutputFlags::empty();
    tty.local_flags = LocalFlags::empty();
    tty.control_flags = ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;

    tty.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
    tty.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    cfsetispeed(&mut tty, speed)?;
    cfsetospeed(&mut tty, speed)?;

    tcsetattr(fd, SetArg::TCSANOW, &tty)?;

    Ok(())
}

impl SerialPort {
    /// Open a device read-only for passive monitoring.
    ///
    /// The device is opened without becoming its controlling terminal and
    /// with non-blocking reads.
    pub fn open_readonly(path: &Path, baud: u32) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| Error::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let fd: OwnedFd = file.into();

        configure_raw(fd.as_fd(), baud_to_speed(baud)).map_err(|errno| Error::ConfigureFailed {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            fd: Some(fd),
            pty_master: None,
            pty_slave: None,
            pty_slave_path: None,
        })
    }

    /// Open a device read-write and pair it with a fresh PTY.
    ///
    /// The real device is marked for exclusive access (advisory; failure is
    /// only warned about). Clients open the PTY slave path instead of the
    /// device and the monitor forwards traffic in both directions.
    pub fn open_proxy(path: &Path, baud: u32) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| Error::OpenFailed {
                path: path.to_path_buf(),
                source,
            })?;

        let fd: OwnedFd = file.into();

        configure_raw(fd.as_fd(), baud_to_speed(baud)).map_err(|errno| Error::ConfigureFailed {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        })?;

        if let Err(errno) = unsafe { ioctl::tiocexcl(fd.as_raw_fd()) } {
            warn!(path = %path.display(), %errno, "Cannot mark device exclusive, continuing");
        }

        let pty = openpty(None, None).map_err(|errno| Error::OpenFailed {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        })?;

        // Raw mode on the slave side too, best effort; a client opening it
        // gets a transparent wire either way.
        if let Err(errno) = configure_raw(pty.slave.as_fd(), baud_to_speed(baud)) {
            warn!(%errno, "Cannot configure PTY slave, continuing");
        }

        let slave_path = ttyname(pty.slave.as_fd()).map_err(|errno| Error::OpenFailed {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        })?;

        fcntl(pty.master.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(|errno| {
            Error::ConfigureFailed {
                path: path.to_path_buf(),
                source: io::Error::from(errno),
            }
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            fd: Some(fd),
            pty_master: Some(pty.master),
            pty_slave: Some(pty.slave),
            pty_slave_path: Some(slave_path),
        })
    }

    /// The device path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The real device descriptor, if open.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }

    /// The PTY master descriptor, if this is a proxy handle.
    pub fn pty_master(&self) -> Option<BorrowedFd<'_>> {
        self.pty_master.as_ref().map(AsFd::as_fd)
    }

    /// The filesystem path of the PTY slave, if this is a proxy handle.
    pub fn pty_slave_path(&self) -> Option<&Path> {
        self.pty_slave_path.as_deref()
    }

    /// Whether the handle currently holds an open device.
    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Close everything. Safe to call more than once.
    pub fn close(&mut self) {
        self.pty_master = None;
        self.pty_slave = None;
        self.pty_slave_path = None;
        self.fd = None;
    }
}
