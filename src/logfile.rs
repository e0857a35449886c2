use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Local;
use tracing::warn;

use crate::error::Error;

/// Upper bound on one logical line; longer lines are broken.
pub const LINE_BUF: usize = 2048;

/// Timestamp format used for line prefixes and markers.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// A per-port append-only log file.
///
/// Bytes go through a small line buffer so every logical line can be given
/// a `[timestamp] ` prefix. The buffer is either empty (no prefix written
/// yet) or holds an in-progress line whose prefix is already in the file;
/// the two move together.
#[derive(Debug)]
pub struct LogFile {
    file: Option<File>,
    path: PathBuf,
    bytes_written: u64,
    line_buf: Vec<u8>,
    last_byte: Instant,
}

impl LogFile {
    /// Open (append) the log for `stem` inside the session directory.
    ///
    /// A non-empty `header` produces the banner block at the top. The
    /// header is expected to end with a newline of its own.
    pub fn open(session_path: &Path, stem: &str, header: Option<&str>) -> Result<Self, Error> {
        let path = session_path.join(format!("{stem}.log"));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| Error::LogOpenFailed {
                path: path.clone(),
                source,
            })?;

        let mut log = Self {
            file: Some(file),
            path,
            bytes_written: 0,
            line_buf: Vec::with_capacity(LINE_BUF),
            last_byte: Instant::now(),
        };

        if let Some(header) = header.filter(|header| !header.is_empty()) {
            log.emit(b"=== UART Monitor Session ===\n", false);
            log.emit(header.as_bytes(), false);
            log.emit(format!("Started: {}\n", timestamp_now()).as_bytes(), false);
            log.emit(b"===\n\n", false);
        }

        Ok(log)
    }

    /// Absolute path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Payload bytes written so far (line content and newlines; the
    /// banner and timestamp prefixes are not counted).
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    fn emit(&mut self, bytes: &[u8], count: bool) {
        let Some(file) = self.file.as_mut() else {
            return;
        };

        if let Err(err) = file.write_all(bytes) {
            warn!(path = %self.path.display(), %err, "Log write failed");
            return;
        }

        if count {
            self.bytes_written += bytes.len() as u64;
        }
    }

    /// Append raw serial bytes, normalizing line endings and inserting a
    /// timestamp prefix at the start of every logical line.
    ///
    /// `\r\n` and bare `\r` both collapse to `\n`. A line reaching the
    /// buffer bound is broken with a forced newline; the remainder starts
    /// a fresh timestamped line with the next byte.
    pub fn write(&mut self, data: &[u8]) {
        if self.file.is_none() || data.is_empty() {
            return;
        }

        for (i, &byte) in data.iter().enumerate() {
            let c = match byte {
                b'\r' if data.get(i + 1) == Some(&b'\n') => continue,
                b'\r' => b'\n',
                other => other,
            };

            if self.line_buf.is_empty() && c != b'\n' {
                // Starting a new line.
                let prefix = format!("[{}] ", timestamp_now());
                self.emit(prefix.as_bytes(), false);
            }

            if c == b'\n' {
                self.flush_line();
                self.emit(b"\n", true);
            } else {
                self.line_buf.push(c);
                if self.line_buf.len() >= LINE_BUF - 1 {
                    // Forced break; the next byte starts a new line.
                    self.flush_line();
                    self.emit(b"\n", true);
                }
            }
        }

        self.last_byte = Instant::now();
    }

    fn flush_line(&mut self) {
        if self.line_buf.is_empty() {
            return;
        }

        let mut pending = std::mem::take(&mut self.line_buf);
        self.emit(&pending, true);
        pending.clear();
        self.line_buf = pending;
    }

    /// Flush a pending partial line, terminating it with a newline.
    /// The line's timestamp prefix was written when its first byte arrived.
    pub fn flush(&mut self) {
        if self.file.is_none() {
            return;
        }

        if !self.line_buf.is_empty() {
            self.flush_line();
            self.emit(b"\n", true);
        }

        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    /// Whether a partial line has been sitting unfinished longer than
    /// `threshold`.
    pub fn is_stale(&self, threshold: std::time::Duration) -> bool {
        !self.line_buf.is_empty() && self.last_byte.elapsed() > threshold
    }

    /// Write a marker line, e.g. for yield/reclaim/disconnect transitions.
    ///
    /// Any pending partial line is terminated first so the marker sits on
    /// its own line.
    pub fn marker(&mut self, msg: &str) {
        if self.file.is_none() {
            return;
        }

        if !self.line_buf.is_empty() {
            let mut pending = std::mem::take(&mut self.line_buf);
            self.emit(&pending, false);
            self.emit(b"\n", false);
            pending.clear();
            self.line_buf = pending;
        }

        let line = format!("\n--- {msg} [{}] ---\n\n", timestamp_now());
        self.emit(line.as_bytes(), false);

        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }

    /// Flush and close. Safe to call more than once.
    pub fn close(&mut self) {
        if self.file.is_some() {
            self.flush();
            self.file = None;
        }
    }
}

impl Drop for LogFile {
    fn drop(&mut self) {
        self.close();
    }
}
