use std::fs;
use std::io;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};

use chrono::Local;
use itertools::Itertools;
use tracing::{debug, warn};

use crate::error::Error;

/// Where sessions, logs and control files live by default.
pub const BASE_DIR: &str = "/tmp/uart-monitor";

/// How many sessions to keep when pruning.
pub const MAX_SESSIONS: usize = 10;

/// Sessions considered per pruning pass.
const PRUNE_SCAN_LIMIT: usize = 256;

/// Replace `link` atomically: a temp symlink is created next to it and
/// renamed over the old one.
fn update_symlink(target: &str, link: &Path) -> io::Result<()> {
    let tmp = PathBuf::from(format!("{}.tmp.{}", link.display(), std::process::id()));

    let _ = fs::remove_file(&tmp);
    symlink(target, &tmp)?;

    if let Err(err) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }

    Ok(())
}

/// Create a timestamped session directory under `base` and point the
/// `latest` symlink at it.
pub fn create_session(base: &Path) -> Result<PathBuf, Error> {
    fs::create_dir_all(base).map_err(|source| Error::SessionCreateFailed {
        path: base.to_path_buf(),
        source,
    })?;

    let name = format!("session-{}", Local::now().format("%Y%m%d-%H%M%S"));
    let session_path = base.join(&name);

    let mut builder = fs::DirBuilder::new();
    builder.mode(0o755);
    if let Err(source) = builder.create(&session_path) {
        if source.kind() != io::ErrorKind::AlreadyExists {
            return Err(Error::SessionCreateFailed {
                path: session_path,
                source,
            });
        }
    }

    if let Err(err) = update_symlink(&name, &base.join("latest")) {
        warn!(%err, "Cannot update latest symlink");
    }

    debug!(session = %session_path.display(), "Session created");

    Ok(session_path)
}

/// Remove old session directories, keeping the `keep` most recent.
///
/// Session names embed their creation time, so sorting them
/// lexicographically sorts them chronologically.
pub fn prune_sessions(base: &Path, keep: usize) -> io::Result<usize> {
    let sessions: Vec<String> = fs::read_dir(base)?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with("session-").then_some(name)
        })
        .take(PRUNE_SCAN_LIMIT)
        .sorted()
        .collect();

    if sessions.len() <= keep {
        return Ok(0);
    }

    let to_remove = sessions.len() - keep;
    for name in &sessions[..to_remove] {
        let session_path = base.join(name);

        if let Ok(entries) = fs::read_dir(&session_path) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let _ = fs::remove_file(entry.path());
            }
        }

        if let Err(err) = fs::remove_dir(&session_path) {
            warn!(session = %session_path.display(), %err, "Cannot remove old session");
        } else {
            debug!(session = %session_path.display(), "Pruned old session");
        }
    }

    Ok(to_remove)
}
