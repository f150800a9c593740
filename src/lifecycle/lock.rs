//! Advisory instance lock held for the lifetime of a foreground agent.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use super::error::{LifecycleError, LifecycleResult};

/// Exclusive `flock` on the lock file. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Take the lock without blocking. A lock held by another process is
    /// [`LifecycleError::LockHeld`].
    pub fn acquire(path: &Path) -> LifecycleResult<Self> {
        let io_err = |source: std::io::Error| LifecycleError::Lock {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;

        // SAFETY: `file` owns a valid descriptor for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(LifecycleError::LockHeld {
                    path: path.display().to_string(),
                });
            }
            return Err(io_err(err));
        }

        // The holder's pid is informational; the flock is what excludes.
        file.set_len(0).map_err(io_err)?;
        let mut writer = &file;
        if let Err(e) = writer
            .write_all(std::process::id().to_string().as_bytes())
            .and_then(|()| writer.flush())
        {
            tracing::debug!(path = %path.display(), error = %e, "could not record pid in lock file");
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still owned by `self.file`.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        // The file stays: deleting it would let a waiter lock an unlinked inode
        // while a newcomer locks a fresh file.
    }
}
