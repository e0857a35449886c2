use std::fs;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::signal::{kill, SigSet, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::socket::{sendto, socket, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};
use nix::unistd::{self, Pid};
use tracing::{debug, error, info, warn};

use crate::control::{self, ControlListener, Request};
use crate::error::Error;
use crate::hotplug::{Hotplug, HotplugAction};
use crate::identify::{self, TtyPort};
use crate::logfile::LogFile;
use crate::serial::SerialPort;
use crate::session;
use crate::status::{PortState, PortStatus, StatusReport, STATUS_FILE};

/// Upper bound on simultaneously monitored ports.
pub const MAX_PORTS: usize = 64;

/// Name of the pid file inside the base directory.
pub const PID_FILE: &str = "uart-monitor.pid";

const MAX_EVENTS: usize = MAX_PORTS + 16;
const READ_BUF: usize = 4096;

/// Responsiveness ceiling of the loop; also paces the stale-line flush.
const WAIT_MS: u16 = 500;

/// A partial line older than this is flushed by the periodic pass.
const STALE_LINE: Duration = Duration::from_millis(200);

/// How long to let the kernel populate sysfs after a hot-plug add.
const SETTLE: Duration = Duration::from_millis(200);

// Event tokens. Ports use their slot index (PTY masters with a high bit
// set); the fixed sources sit at the top of the token space.
const TOKEN_SIGNAL: u64 = u64::MAX;
const TOKEN_HOTPLUG: u64 = u64::MAX - 1;
const TOKEN_CONTROL: u64 = u64::MAX - 2;
const PTY_TOKEN: u64 = 1 << 32;

/// Options for the `monitor` subcommand.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Base directory for sessions, logs and control files.
    pub base: PathBuf,
    /// Baud rate applied to every monitored port.
    pub baud: u32,
    /// Comma-separated device filter; empty means monitor everything.
    pub only: Option<String>,
    /// Stay in the foreground.
    pub foreground: bool,
    /// Send service-manager readiness notifications.
    pub systemd: bool,
    /// Hold ports exclusively and expose a PTY per port.
    pub proxy: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            base: PathBuf::from(session::BASE_DIR),
            baud: 115_200,
            only: None,
            foreground: false,
            systemd: false,
            proxy: false,
        }
    }
}

/// Exclusive daemon lock, held as a pid file.
///
/// A stale file left by a dead daemon is recovered by probing the
/// recorded pid with signal 0. The file is removed on drop.
#[derive(Debug)]
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn create(base: &Path) -> Result<Self, Error> {
        let path = base.join(PID_FILE);

        if let Ok(content) = fs::read_to_string(&path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                if old_pid > 0 && kill(Pid::from_raw(old_pid), None).is_ok() {
                    return Err(Error::AlreadyRunning { pid: old_pid });
                }
            }
            let _ = fs::remove_file(&path);
        }

        fs::write(&path, format!("{}\n", std::process::id()))?;

        Ok(Self { path })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Send a state change to the service manager, if one is listening.
///
/// Both abstract (`@`-prefixed) and filesystem socket addresses are
/// honored. Failures are ignored; the notification is best effort.
fn sd_notify(state: &str) {
    let Ok(socket_path) = std::env::var("NOTIFY_SOCKET") else {
        return;
    };

    let Ok(fd) = socket(
        AddressFamily::Unix,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    ) else {
        return;
    };

    let addr = if let Some(name) = socket_path.strip_prefix('@') {
        UnixAddr::new_abstract(name.as_bytes())
    } else {
        UnixAddr::new(Path::new(&socket_path))
    };

    if let Ok(addr) = addr {
        let _ = sendto(fd.as_raw_fd(), state.as_bytes(), &addr, MsgFlags::empty());
    }
}

/// Check a device path against the `--only` filter.
///
/// Each comma-separated token (leading spaces trimmed) matches either the
/// full device path or the bare tty name. An empty filter matches all.
fn filter_matches(dev_path: &str, filter: Option<&str>) -> bool {
    let Some(filter) = filter.filter(|f| !f.is_empty()) else {
        return true;
    };

    filter
        .split(',')
        .map(|token| token.trim_start_matches(' '))
        .any(|token| {
            token == dev_path
                || Path::new(dev_path)
                    .file_name()
                    .is_some_and(|name| name.to_string_lossy() == token)
        })
}

/// One monitored port: identity, descriptors, log and counters.
struct MonitoredPort {
    identity: TtyPort,
    serial: SerialPort,
    log: LogFile,
    yielded: bool,
    bytes_read: u64,
}

/// The daemon state: event facility, auxiliary sources and the dense
/// port table.
///
/// Port slots are index-stable between mutations; removal compacts the
/// table and re-registers the shifted descriptors under their new index
/// tokens.
pub struct Monitor {
    base: PathBuf,
    baud: u32,
    only: Option<String>,
    proxy: bool,
    _pidfile: PidFile,
    epoll: Epoll,
    signals: SignalFd,
    hotplug: Option<Hotplug>,
    control: Option<ControlListener>,
    session_path: PathBuf,
    ports: Vec<MonitoredPort>,
    running: bool,
}

impl Monitor {
    /// Set up the daemon: lock, session, event sources and the initial
    /// port scan.
    pub fn new(opts: MonitorOptions) -> Result<Self, Error> {
        fs::create_dir_all(&opts.base)?;

        let pidfile = PidFile::create(&opts.base)?;

        let session_path = session::create_session(&opts.base)?;
        if let Err(err) = session::prune_sessions(&opts.base, session::MAX_SESSIONS) {
            warn!(%err, "Session pruning failed");
        }

        info!(session = %session_path.display(), "uart-monitor starting");

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGHUP);
        mask.thread_block().map_err(io::Error::from)?;

        let signals = SignalFd::with_flags(&mask, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)
            .map_err(io::Error::from)?;
        epoll
            .add(&signals, EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_SIGNAL))
            .map_err(io::Error::from)?;

        let hotplug = match Hotplug::new() {
            Ok(hotplug) => {
                match epoll.add(
                    hotplug.as_fd(),
                    EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_HOTPLUG),
                ) {
                    Ok(()) => Some(hotplug),
                    Err(errno) => {
                        warn!(%errno, "Cannot register hot-plug source");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(%err, "Hot-plug detection unavailable");
                None
            }
        };

        let control = match ControlListener::bind(&opts.base) {
            Ok(control) => {
                match epoll.add(
                    control.as_fd(),
                    EpollEvent::new(EpollFlags::EPOLLIN, TOKEN_CONTROL),
                ) {
                    Ok(()) => Some(control),
                    Err(errno) => {
                        warn!(%errno, "Cannot register control socket");
                        None
                    }
                }
            }
            Err(err) => {
                warn!(%err, "Control socket unavailable");
                None
            }
        };

        let mut monitor = Self {
            base: opts.base,
            baud: opts.baud,
            only: opts.only,
            proxy: opts.proxy,
            _pidfile: pidfile,
            epoll,
            signals,
            hotplug,
            control,
            session_path,
            ports: Vec::with_capacity(MAX_PORTS),
            running: true,
        };

        let mut found = identify::scan_all_ports();
        let overrides = identify::load_board_overrides();
        if !overrides.is_empty() {
            identify::apply_board_overrides(&mut found, &overrides);
        }

        info!("Found {} serial port(s)", found.len());

        for identity in found {
            monitor.add_port_logged(identity);
        }

        monitor.write_status();

        if monitor.ports.is_empty() {
            info!("No matching serial ports to monitor (will detect hot-plugged devices)");
        }

        Ok(monitor)
    }

    /// The main loop: wait for readiness, dispatch, flush stragglers.
    pub fn run_loop(&mut self) {
        let mut events = vec![EpollEvent::empty(); MAX_EVENTS];
        let mut buf = [0u8; READ_BUF];

        while self.running {
            let ready = match self.epoll.wait(&mut events, EpollTimeout::from(WAIT_MS)) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    error!(%errno, "Event wait failed");
                    break;
                }
            };

            for event in &events[..ready] {
                match event.data() {
                    TOKEN_SIGNAL => self.handle_signal(),
                    TOKEN_HOTPLUG => self.handle_hotplug(),
                    TOKEN_CONTROL => self.handle_control(),
                    token if token & PTY_TOKEN != 0 => {
                        let idx = (token & !PTY_TOKEN) as usize;
                        if idx < self.ports.len() {
                            self.forward_pty(idx, &mut buf);
                        }
                    }
                    token => {
                        let idx = token as usize;
                        if idx >= self.ports.len() {
                            continue;
                        }
                        if !self.read_serial(idx, &mut buf) {
                            // A removal compacted the table; the indices
                            // in the rest of this batch are stale.
                            break;
                        }
                    }
                }

                if !self.running {
                    break;
                }
            }

            self.flush_stale();
        }
    }

    /// Flush and close every port, drop the auxiliary sources and remove
    /// the published files.
    pub fn shutdown(&mut self) {
        info!("Shutting down");

        let labels: Vec<String> = self
            .ports
            .iter()
            .map(|port| port.identity.label.clone())
            .collect();

        for port in self.ports.iter_mut().rev() {
            port.log.marker("MONITOR STOPPED");
            port.log.close();
            port.serial.close();
        }
        self.ports.clear();

        if self.proxy {
            for label in labels {
                let _ = fs::remove_file(self.base.join("pty").join(label));
            }
        }

        self.hotplug = None;
        self.control = None;

        let _ = fs::remove_file(self.base.join(STATUS_FILE));

        info!("Stopped");
    }

    fn handle_signal(&mut self) {
        let Ok(Some(siginfo)) = self.signals.read_signal() else {
            return;
        };

        match Signal::try_from(siginfo.ssi_signo as i32) {
            Ok(Signal::SIGTERM) | Ok(Signal::SIGINT) => {
                info!("Shutdown signal received");
                self.running = false;
            }
            Ok(Signal::SIGHUP) => {
                info!("SIGHUP, rescanning ports");
                self.rescan();
            }
            _ => {}
        }
    }

    /// Rescan all ttys and absorb any new ones; `add_port` rejects the
    /// ones already monitored.
    fn rescan(&mut self) {
        let mut found = identify::scan_all_ports();
        let overrides = identify::load_board_overrides();
        if !overrides.is_empty() {
            identify::apply_board_overrides(&mut found, &overrides);
        }

        for identity in found {
            self.add_port_logged(identity);
        }

        self.write_status();
    }

    fn handle_hotplug(&mut self) {
        let event = {
            let Some(hotplug) = self.hotplug.as_ref() else {
                return;
            };
            match hotplug.read() {
                Ok(Some(event)) => event,
                Ok(None) => return,
                Err(err) => {
                    warn!(%err, "Hot-plug read failed");
                    return;
                }
            }
        };

        match event.action {
            HotplugAction::Add => {
                info!(dev = %event.devpath.display(), "Hot-plug: added");

                // Give the kernel a moment to finish populating sysfs.
                std::thread::sleep(SETTLE);

                match identify::identify_port(&event.devpath) {
                    Ok(mut identity) => {
                        let overrides = identify::load_board_overrides();
                        if !overrides.is_empty() {
                            identify::apply_board_overrides(
                                std::slice::from_mut(&mut identity),
                                &overrides,
                            );
                        }

                        self.add_port_logged(identity);
                        self.write_status();
                    }
                    Err(err) => debug!(%err, "Hot-plugged device not identifiable"),
                }
            }
            HotplugAction::Remove => {
                info!(dev = %event.devpath.display(), "Hot-plug: removed");

                if let Some(idx) = self.find_port(&event.devpath.display().to_string()) {
                    self.remove_port(idx);
                    self.write_status();
                }
            }
        }
    }

    fn handle_control(&mut self) {
        let Some(mut stream) = self
            .control
            .as_ref()
            .and_then(|control| control.accept().ok().flatten())
        else {
            return;
        };

        let line = match control::read_request(&mut stream) {
            Ok(line) => line,
            Err(err) => {
                debug!(%err, "Control client vanished");
                return;
            }
        };

        let response = match control::parse_request(&line) {
            Request::Status => {
                self.write_status();
                fs::read_to_string(self.base.join(STATUS_FILE))
                    .unwrap_or_else(|_| "ERROR cannot read status\n".to_string())
            }
            Request::Yield(dev) => match self.find_port(&dev) {
                Some(idx) => self.yield_port(idx),
                None => format!("ERROR port not found: {dev}\n"),
            },
            Request::Reclaim(dev) => match self.find_port(&dev) {
                Some(idx) => self.reclaim_port(idx),
                None => format!("ERROR port not found: {dev}\n"),
            },
            Request::Quit => {
                self.running = false;
                "OK shutting down\n".to_string()
            }
            Request::Unknown(line) => format!("ERROR unknown command: {line}\n"),
        };

        let _ = stream.write_all(response.as_bytes());
    }

    /// Read up to one buffer of serial data and log it.
    ///
    /// Returns `false` when the port was removed (EOF or a terminal read
    /// error), which invalidates the indices of the current event batch.
    fn read_serial(&mut self, idx: usize, buf: &mut [u8]) -> bool {
        let result = {
            let port = &self.ports[idx];
            let Some(fd) = port.serial.fd() else {
                return true;
            };
            unistd::read(fd.as_raw_fd(), buf)
        };

        match result {
            Ok(n) if n > 0 => {
                let port = &mut self.ports[idx];
                port.log.write(&buf[..n]);
                port.bytes_read += n as u64;

                // Proxy plane: echo out to whoever holds the PTY.
                if let Some(master) = port.serial.pty_master() {
                    match unistd::write(master, &buf[..n]) {
                        Ok(_) | Err(Errno::EAGAIN) => {}
                        Err(errno) => {
                            debug!(port = %port.identity, %errno, "PTY echo failed")
                        }
                    }
                }

                true
            }
            Err(Errno::EAGAIN) => true,
            Ok(_) | Err(_) => {
                let port = &self.ports[idx];
                match result {
                    Ok(_) => error!(port = %port.identity, "EOF on serial read"),
                    Err(errno) => error!(port = %port.identity, %errno, "Serial read failed"),
                }

                self.remove_port(idx);
                self.write_status();
                false
            }
        }
    }

    /// Proxy plane, client direction: bytes written to the PTY slave are
    /// forwarded onto the real device.
    fn forward_pty(&mut self, idx: usize, buf: &mut [u8]) {
        let result = {
            let port = &self.ports[idx];
            let Some(master) = port.serial.pty_master() else {
                return;
            };
            unistd::read(master.as_raw_fd(), buf)
        };

        match result {
            Ok(n) if n > 0 => {
                let port = &self.ports[idx];
                if let Some(fd) = port.serial.fd() {
                    match unistd::write(fd, &buf[..n]) {
                        Ok(_) | Err(Errno::EAGAIN) => {}
                        Err(errno) => {
                            warn!(port = %port.identity, %errno, "PTY forward failed")
                        }
                    }
                }
            }
            Ok(_) | Err(Errno::EAGAIN) | Err(Errno::EIO) => {}
            Err(errno) => {
                warn!(port = %self.ports[idx].identity, %errno, "PTY read failed")
            }
        }
    }

    fn find_port(&self, dev_path: &str) -> Option<usize> {
        self.ports
            .iter()
            .position(|port| port.identity.dev_path == Path::new(dev_path))
    }

    /// Add a port, logging expected refusals quietly and real failures
    /// loudly.
    fn add_port_logged(&mut self, identity: TtyPort) {
        let dev = identity.dev_path.display().to_string();

        match self.add_port(identity) {
            Ok(_) => {}
            Err(err @ (Error::Duplicate { .. } | Error::FilterExcluded { .. })) => {
                debug!(%dev, %err, "Skipping port");
            }
            Err(err) => warn!(%dev, %err, "Cannot monitor port"),
        }
    }

    /// Start monitoring an identified port.
    ///
    /// Opens the device, opens the log with its banner, and registers the
    /// descriptor under the new slot's index token. Everything is undone
    /// if a later step fails.
    pub fn add_port(&mut self, identity: TtyPort) -> Result<usize, Error> {
        if self.ports.len() >= MAX_PORTS {
            return Err(Error::PortTableFull);
        }

        let dev = identity.dev_path.display().to_string();

        if !filter_matches(&dev, self.only.as_deref()) {
            return Err(Error::FilterExcluded { dev_path: dev });
        }

        if self
            .ports
            .iter()
            .any(|port| port.identity.dev_path == identity.dev_path)
        {
            return Err(Error::Duplicate { dev_path: dev });
        }

        let mut serial = self.open_serial(&identity.dev_path)?;

        let header = format!(
            "Device: {} ({})\nBoard: {} | Interface {} | Function: {}\nBaud: 115200 8N1\n",
            dev,
            identity.label,
            identity.board(),
            identity.interface,
            identity.function,
        );

        let mut log = LogFile::open(&self.session_path, &identity.label, Some(&header))?;

        let idx = self.ports.len();

        {
            let fd = serial.fd().expect("descriptor open right after open");
            if let Err(errno) = self
                .epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, idx as u64))
            {
                log.close();
                serial.close();
                return Err(Error::RegisterFailed {
                    path: identity.dev_path.clone(),
                    source: errno.into(),
                });
            }
        }

        if let Some(master) = serial.pty_master() {
            if let Err(errno) = self.epoll.add(
                master,
                EpollEvent::new(EpollFlags::EPOLLIN, PTY_TOKEN | idx as u64),
            ) {
                warn!(%dev, %errno, "Cannot register PTY master, proxy input disabled");
            }
        }

        self.publish_pty_link(&serial, &identity.label);

        info!(port = %identity, log = %log.path().display(), "Monitoring");

        self.ports.push(MonitoredPort {
            identity,
            serial,
            log,
            yielded: false,
            bytes_read: 0,
        });

        Ok(idx)
    }

    fn open_serial(&self, dev_path: &Path) -> Result<SerialPort, Error> {
        if self.proxy {
            SerialPort::open_proxy(dev_path, self.baud)
        } else {
            SerialPort::open_readonly(dev_path, self.baud)
        }
    }

    /// Publish `<base>/pty/<label>` pointing at the PTY slave.
    fn publish_pty_link(&self, serial: &SerialPort, label: &str) {
        let Some(slave_path) = serial.pty_slave_path() else {
            return;
        };

        let pty_dir = self.base.join("pty");
        if let Err(err) = fs::create_dir_all(&pty_dir) {
            warn!(%err, "Cannot create pty directory");
            return;
        }

        let link = pty_dir.join(label);
        let _ = fs::remove_file(&link);
        if let Err(err) = symlink(slave_path, &link) {
            warn!(%err, link = %link.display(), "Cannot publish pty link");
        }
    }

    /// Stop monitoring the port in slot `idx` and compact the table.
    ///
    /// Descriptors of the shifted ports are re-registered under their new
    /// index tokens so every event keeps resolving to the right slot.
    pub fn remove_port(&mut self, idx: usize) {
        if idx >= self.ports.len() {
            return;
        }

        {
            let port = &mut self.ports[idx];

            if let Some(fd) = port.serial.fd() {
                let _ = self.epoll.delete(fd);
            }
            if let Some(master) = port.serial.pty_master() {
                let _ = self.epoll.delete(master);
            }

            port.log.marker("PORT DISCONNECTED");
            port.log.close();
            port.serial.close();

            info!(port = %port.identity, bytes_read = port.bytes_read, "Removed");
        }

        if self.proxy {
            let label = self.ports[idx].identity.label.clone();
            let _ = fs::remove_file(self.base.join("pty").join(label));
        }

        self.ports.remove(idx);

        for i in idx..self.ports.len() {
            let port = &self.ports[i];

            if !port.yielded {
                if let Some(fd) = port.serial.fd() {
                    let mut event = EpollEvent::new(EpollFlags::EPOLLIN, i as u64);
                    let _ = self.epoll.modify(fd, &mut event);
                }
            }

            if let Some(master) = port.serial.pty_master() {
                let mut event = EpollEvent::new(EpollFlags::EPOLLIN, PTY_TOKEN | i as u64);
                let _ = self.epoll.modify(master, &mut event);
            }
        }
    }

    /// Release a port's descriptor so another tool can open the device.
    /// The log stays open; yielding twice is fine.
    pub fn yield_port(&mut self, idx: usize) -> String {
        let response;

        {
            let port = &mut self.ports[idx];
            let dev = port.identity.dev_path.display().to_string();

            if port.yielded {
                return format!("OK already yielded {dev}\n");
            }

            if let Some(fd) = port.serial.fd() {
                let _ = self.epoll.delete(fd);
            }
            if let Some(master) = port.serial.pty_master() {
                let _ = self.epoll.delete(master);
            }
            port.serial.close();

            port.yielded = true;
            port.log.marker("PORT YIELDED (released for flashing)");

            info!(port = %port.identity, "Yielded");

            response = format!("OK yielded {dev}\n");
        }

        if self.proxy {
            let label = self.ports[idx].identity.label.clone();
            let _ = fs::remove_file(self.base.join("pty").join(label));
        }

        self.write_status();

        response
    }

    /// Re-acquire a yielded port, registering the fresh descriptor under
    /// the unchanged slot token. Reclaiming twice is fine.
    pub fn reclaim_port(&mut self, idx: usize) -> String {
        let (dev_path, dev, label) = {
            let port = &self.ports[idx];
            if !port.yielded {
                return format!(
                    "OK already monitoring {}\n",
                    port.identity.dev_path.display()
                );
            }
            (
                port.identity.dev_path.clone(),
                port.identity.dev_path.display().to_string(),
                port.identity.label.clone(),
            )
        };

        let mut serial = match self.open_serial(&dev_path) {
            Ok(serial) => serial,
            Err(err) => {
                warn!(%dev, %err, "Reclaim failed");
                return format!("ERROR cannot reopen {dev}\n");
            }
        };

        {
            let fd = serial.fd().expect("descriptor open right after open");
            if let Err(errno) = self
                .epoll
                .add(fd, EpollEvent::new(EpollFlags::EPOLLIN, idx as u64))
            {
                warn!(%dev, %errno, "Reclaim registration failed");
                serial.close();
                return format!("ERROR epoll add failed for {dev}\n");
            }
        }

        if let Some(master) = serial.pty_master() {
            if let Err(errno) = self.epoll.add(
                master,
                EpollEvent::new(EpollFlags::EPOLLIN, PTY_TOKEN | idx as u64),
            ) {
                warn!(%dev, %errno, "Cannot register PTY master, proxy input disabled");
            }
        }

        self.publish_pty_link(&serial, &label);

        {
            let port = &mut self.ports[idx];
            port.serial = serial;
            port.yielded = false;
            port.log.marker("PORT RECLAIMED (monitoring resumed)");
            info!(port = %port.identity, "Reclaimed");
        }

        self.write_status();

        format!("OK reclaimed {dev}\n")
    }

    fn flush_stale(&mut self) {
        for port in &mut self.ports {
            if port.log.is_stale(STALE_LINE) {
                port.log.flush();
            }
        }
    }

    /// Publish the status snapshot.
    pub fn write_status(&self) {
        let report = StatusReport {
            pid: std::process::id() as i32,
            session: self
                .session_path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            port_count: self.ports.len(),
            ports: self
                .ports
                .iter()
                .map(|port| PortStatus {
                    device: port.identity.dev_path.display().to_string(),
                    label: port.identity.label.clone(),
                    board: port.identity.board().to_string(),
                    function: port.identity.function.to_string(),
                    vid: format!("{:04x}", port.identity.vid),
                    pid: format!("{:04x}", port.identity.pid),
                    status: if port.yielded {
                        PortState::Yielded
                    } else {
                        PortState::Monitoring
                    },
                    log_file: port.log.path().display().to_string(),
                    bytes_logged: port.log.bytes_written(),
                })
                .collect(),
        };

        if let Err(err) = report.write(&self.base) {
            warn!(%err, "Cannot write status snapshot");
        }
    }
}

/// Run the monitoring daemon until told to stop.
pub fn run(opts: MonitorOptions) -> Result<(), Error> {
    let systemd = opts.systemd;
    let foreground = opts.foreground || systemd;

    let mut monitor = Monitor::new(opts)?;

    if systemd {
        sd_notify("READY=1");
    }

    info!("Monitoring... (Ctrl-C to stop)");
    if !foreground {
        info!("Logs: {}/latest/*.log", monitor.base.display());
    }

    monitor.run_loop();
    monitor.shutdown();

    if systemd {
        sd_notify("STOPPING=1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_matches_everything() {
        assert!(filter_matches("/dev/ttyUSB0", None));
        assert!(filter_matches("/dev/ttyUSB0", Some("")));
    }

    #[test]
    fn filter_matches_full_path_and_tty_name() {
        assert!(filter_matches("/dev/ttyUSB0", Some("/dev/ttyUSB0")));
        assert!(filter_matches("/dev/ttyUSB0", Some("ttyUSB0")));
        assert!(!filter_matches("/dev/ttyUSB1", Some("ttyUSB0")));
    }

    #[test]
    fn filter_splits_on_commas_and_trims_spaces() {
        let filter = Some("ttyACM0, /dev/ttyUSB3, ttyUSB7");

        assert!(filter_matches("/dev/ttyUSB3", filter));
        assert!(filter_matches("/dev/ttyUSB7", filter));
        assert!(filter_matches("/dev/ttyACM0", filter));
        assert!(!filter_matches("/dev/ttyUSB0", filter));
    }

    #[test]
    fn pid_file_recovers_stale_entries() {
        let dir = tempfile::tempdir().unwrap();

        // A dead pid: spawn a child and reap it, then claim its pid.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        std::fs::write(dir.path().join(PID_FILE), format!("{dead_pid}\n")).unwrap();

        let pidfile = PidFile::create(dir.path()).unwrap();
        let content = std::fs::read_to_string(dir.path().join(PID_FILE)).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());

        drop(pidfile);
        assert!(!dir.path().join(PID_FILE).exists());
    }

    #[test]
    fn pid_file_refuses_live_daemon() {
        let dir = tempfile::tempdir().unwrap();

        // Our own pid is definitely alive.
        std::fs::write(dir.path().join(PID_FILE), format!("{}\n", std::process::id())).unwrap();

        let err = PidFile::create(dir.path()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
    }

    #[test]
    fn port_tokens_do_not_collide_with_fixed_tokens() {
        assert!(((MAX_PORTS - 1) as u64) < TOKEN_CONTROL);
        assert!((PTY_TOKEN | (MAX_PORTS - 1) as u64) < TOKEN_CONTROL);
    }
}
