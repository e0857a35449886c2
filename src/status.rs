use std::fmt::Display;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Name of the snapshot file inside the base directory.
pub const STATUS_FILE: &str = "status.json";

/// Whether a port is actively read or handed over to another tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    /// The daemon holds the descriptor and logs its output.
    Monitoring,
    /// The descriptor is closed so another tool may open the device.
    Yielded,
}

impl Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Monitoring => write!(f, "monitoring"),
            PortState::Yielded => write!(f, "yielded"),
        }
    }
}

/// Status of one monitored port as published in the snapshot.
///
/// Field order fixes the JSON key order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortStatus {
    /// Device node path.
    pub device: String,
    /// Filesystem-safe label.
    pub label: String,
    /// Resolved board name.
    pub board: String,
    /// Interface function name.
    pub function: String,
    /// USB vendor id, four hex digits.
    pub vid: String,
    /// USB product id, four hex digits.
    pub pid: String,
    /// Monitoring or yielded.
    pub status: PortState,
    /// Absolute log file path.
    pub log_file: String,
    /// Payload bytes logged so far.
    pub bytes_logged: u64,
}

/// The daemon status snapshot written to `status.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    /// Daemon pid.
    pub pid: i32,
    /// Basename of the current session directory.
    pub session: String,
    /// Number of monitored ports.
    pub port_count: usize,
    /// Per-port entries.
    pub ports: Vec<PortStatus>,
}

impl StatusReport {
    /// Write the snapshot to `<base>/status.json`, atomically via a
    /// temp file and rename.
    pub fn write(&self, base: &Path) -> io::Result<()> {
        let target = base.join(STATUS_FILE);
        let tmp = base.join(format!("{STATUS_FILE}.tmp.{}", std::process::id()));

        let mut payload = serde_json::to_string_pretty(self)?;
        payload.push('\n');

        fs::write(&tmp, payload)?;

        if let Err(err) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(err);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusReport {
        StatusReport {
            pid: 4242,
            session: "session-20260101-120000".to_string(),
            port_count: 1,
            ports: vec![PortStatus {
                device: "/dev/ttyUSB0".to_string(),
                label: "POLARFIRE_SOC_UART0".to_string(),
                board: "PolarFire SoC".to_string(),
                function: "UART0".to_string(),
                vid: "10c4".to_string(),
                pid: "ea71".to_string(),
                status: PortState::Monitoring,
                log_file: "/tmp/uart-monitor/latest/POLARFIRE_SOC_UART0.log".to_string(),
                bytes_logged: 123,
            }],
        }
    }

    #[test]
    fn key_order_is_stable() {
        let json = serde_json::to_string(&sample()).unwrap();

        let pid_at = json.find("\"pid\"").unwrap();
        let session_at = json.find("\"session\"").unwrap();
        let count_at = json.find("\"port_count\"").unwrap();
        let ports_at = json.find("\"ports\"").unwrap();

        assert!(pid_at < session_at);
        assert!(session_at < count_at);
        assert!(count_at < ports_at);
    }

    #[test]
    fn port_state_spelling() {
        let json = serde_json::to_string(&sample()).unwrap();

        assert!(json.contains("\"status\":\"monitoring\""));
    }

    #[test]
    fn round_trips() {
        let report = sample();
        let json = serde_json::to_string_pretty(&report).unwrap();
        let back: StatusReport = serde_json::from_str(&json).unwrap();

        assert_eq!(back.pid, report.pid);
        assert_eq!(back.port_count, 1);
        assert_eq!(back.ports[0].vid, "10c4");
    }

    #[test]
    fn atomic_write_lands_in_base() {
        let dir = tempfile::tempdir().unwrap();

        sample().write(dir.path()).unwrap();

        let content = fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap();
        assert!(content.contains("\"session\": \"session-20260101-120000\""));
        assert!(!dir
            .path()
            .join(format!("{STATUS_FILE}.tmp.{}", std::process::id()))
            .exists());
    }
}
