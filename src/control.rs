use std::fs;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::debug;

use crate::error::Error;
use crate::session;

/// Name of the control socket inside the base directory.
pub const SOCKET_NAME: &str = "uart-monitor.sock";

/// Bound on one request or response.
pub const MAX_MSG: usize = 4096;

/// A request received over the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Return the status document.
    Status,
    /// Release the named device.
    Yield(String),
    /// Re-acquire the named device.
    Reclaim(String),
    /// Shut the daemon down.
    Quit,
    /// Anything else; carries the offending line.
    Unknown(String),
}

/// Parse one newline-stripped request line.
pub fn parse_request(line: &str) -> Request {
    if line == "STATUS" {
        return Request::Status;
    }
    if let Some(dev) = line.strip_prefix("YIELD ") {
        return Request::Yield(dev.to_string());
    }
    if let Some(dev) = line.strip_prefix("RECLAIM ") {
        return Request::Reclaim(dev.to_string());
    }
    if line == "QUIT" {
        return Request::Quit;
    }

    Request::Unknown(line.to_string())
}

/// The daemon side of the control socket.
///
/// Clients connect, send a single newline-terminated command, receive a
/// single response and are disconnected. The socket path is removed when
/// the listener is dropped.
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind the control socket inside `base`, replacing any stale socket.
    pub fn bind(base: &Path) -> Result<Self, Error> {
        let path = base.join(SOCKET_NAME);

        let _ = fs::remove_file(&path);

        let listener = UnixListener::bind(&path).map_err(|source| Error::RegisterFailed {
            path: path.clone(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| Error::RegisterFailed {
                path: path.clone(),
                source,
            })?;

        debug!(path = %path.display(), "Control socket listening");

        Ok(Self { listener, path })
    }

    /// The descriptor to wait for readiness on.
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.listener.as_fd()
    }

    /// Accept one client, if any is waiting.
    pub fn accept(&self) -> io::Result<Option<UnixStream>> {
        match self.listener.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Read one bounded request line from a freshly accepted client.
pub fn read_request(stream: &mut UnixStream) -> io::Result<String> {
    let mut buf = [0u8; MAX_MSG];
    let n = stream.read(&mut buf)?;

    let line = String::from_utf8_lossy(&buf[..n]);
    Ok(line.trim_end_matches(['\n', '\r']).to_string())
}

/// Send a command to a running daemon and return its response.
///
/// Used by the `status`, `yield` and `reclaim` subcommands.
pub fn send_command(base: &Path, command: &str) -> Result<String, Error> {
    let sock_path = base.join(SOCKET_NAME);

    let mut stream = UnixStream::connect(&sock_path).map_err(|source| Error::OpenFailed {
        path: sock_path,
        source,
    })?;

    stream.write_all(command.as_bytes())?;

    let mut response = String::new();
    stream.take(MAX_MSG as u64).read_to_string(&mut response)?;

    Ok(response)
}

/// Follow the latest log of a port, by device name or label.
///
/// Resolves `<base>/latest/<name>.log` (a `/dev/` prefix is stripped
/// first) and hands off to `tail -f`.
pub fn tail_log(base: &Path, name: &str) -> Result<(), Error> {
    let name = name.strip_prefix("/dev/").unwrap_or(name);
    let log_path = base.join("latest").join(format!("{name}.log"));

    if fs::metadata(&log_path).is_err() {
        eprintln!("Log file not found: {}", log_path.display());
        eprintln!("Available logs in {}/latest/:", base.display());

        if let Ok(entries) = fs::read_dir(base.join("latest")) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().ends_with(".log") {
                    eprintln!("  {}", entry.path().display());
                }
            }
        }

        return Err(Error::PortNotFound {
            dev_path: name.to_string(),
        });
    }

    println!("Tailing {} (Ctrl-C to stop)...\n", log_path.display());

    let status = Command::new("tail").arg("-f").arg(&log_path).status()?;
    if !status.success() {
        return Err(Error::Io(io::Error::other("tail exited with failure")));
    }

    Ok(())
}

/// Convenience wrapper for client subcommands against the default base
/// directory.
pub fn send_to_daemon(command: &str) -> Result<String, Error> {
    send_command(Path::new(session::BASE_DIR), command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_request("STATUS"), Request::Status);
        assert_eq!(parse_request("QUIT"), Request::Quit);
        assert_eq!(
            parse_request("YIELD /dev/ttyUSB0"),
            Request::Yield("/dev/ttyUSB0".to_string())
        );
        assert_eq!(
            parse_request("RECLAIM /dev/ttyUSB0"),
            Request::Reclaim("/dev/ttyUSB0".to_string())
        );
    }

    #[test]
    fn unknown_commands_carry_the_line() {
        assert_eq!(
            parse_request("FROBNICATE"),
            Request::Unknown("FROBNICATE".to_string())
        );
        // Case matters.
        assert_eq!(
            parse_request("status"),
            Request::Unknown("status".to_string())
        );
    }

    #[test]
    fn listener_binds_and_accepts_nothing() {
        let dir = tempfile::tempdir().unwrap();

        let listener = ControlListener::bind(dir.path()).unwrap();
        assert!(listener.accept().unwrap().is_none());

        let sock_path = dir.path().join(SOCKET_NAME);
        assert!(sock_path.exists());

        drop(listener);
        assert!(!sock_path.exists());
    }

    #[test]
    fn listener_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join(SOCKET_NAME);

        fs::write(&sock_path, b"stale").unwrap();

        let _listener = ControlListener::bind(dir.path()).unwrap();
        assert!(sock_path.exists());
    }

    #[test]
    fn request_response_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let listener = ControlListener::bind(dir.path()).unwrap();

        let mut client = UnixStream::connect(dir.path().join(SOCKET_NAME)).unwrap();
        client.write_all(b"YIELD /dev/ttyUSB0\n").unwrap();

        let mut server_side = listener.accept().unwrap().expect("client waiting");
        let line = read_request(&mut server_side).unwrap();
        assert_eq!(parse_request(&line), Request::Yield("/dev/ttyUSB0".into()));

        server_side.write_all(b"OK yielded /dev/ttyUSB0\n").unwrap();
        drop(server_side);

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert_eq!(response, "OK yielded /dev/ttyUSB0\n");
    }
}
