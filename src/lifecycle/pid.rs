//! PID marker: the running agent's identity on disk.
//!
//! Written by the foreground agent after the control socket is bound and
//! removed after its loop has exited. Clients only ever read it.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidMarker {
    pub pid: u32,
    /// Control socket the agent listens on.
    pub socket: PathBuf,
    /// Agent build version.
    pub version: String,
    pub started_at: DateTime<Utc>,
}

impl PidMarker {
    /// Marker describing the current process.
    pub fn current(socket: &Path) -> Self {
        Self {
            pid: std::process::id(),
            socket: socket.to_path_buf(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        }
    }

    /// Write atomically (temp file + rename) so readers never see half a marker.
    pub fn write(&self, path: &Path) -> LifecycleResult<()> {
        let err = |source: std::io::Error| LifecycleError::PidMarker {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(err)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| err(std::io::Error::other(e)))?;
        let tmp = path.with_extension("pid.tmp");
        std::fs::write(&tmp, json).map_err(err)?;
        std::fs::rename(&tmp, path).map_err(err)
    }

    /// Read a marker. Missing or unreadable markers read as `None`.
    pub fn read(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn is_alive(&self) -> bool {
        process_alive(self.pid)
    }
}

/// Marker whose process is still alive. Stale markers read as `None` and are
/// left in place.
pub fn live_marker(path: &Path) -> Option<PidMarker> {
    PidMarker::read(path).filter(PidMarker::is_alive)
}

/// Fail with [`LifecycleError::AlreadyRunning`] if a live agent owns the marker.
pub fn ensure_not_running(path: &Path) -> LifecycleResult<()> {
    match live_marker(path) {
        Some(marker) => Err(LifecycleError::AlreadyRunning { pid: marker.pid }),
        None => Ok(()),
    }
}

/// Remove the marker, but only if it still names this process.
pub fn remove_own_marker(path: &Path) {
    match PidMarker::read(path) {
        Some(marker) if marker.pid != std::process::id() => {
            tracing::warn!(pid = marker.pid, "PID marker belongs to another process, leaving it");
        }
        _ => {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Whether a process with this PID exists.
///
/// `EPERM` means the process exists but belongs to another user, which still
/// counts as alive.
pub fn process_alive(pid: u32) -> bool {
    // PIDs that wrap negative would address process groups.
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs the existence and permission checks only.
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
