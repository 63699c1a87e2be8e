//! PID file guard
//!
//! Keeps two daemons from sharing a configuration and its fail registry.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// PID file removed when dropped
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID, refusing when the file names a live process
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(pid) = read_pid(path) {
            if is_pid_alive(pid) {
                bail!(
                    "pid file '{}' already exists (process {} is running)",
                    path.display(),
                    pid
                );
            }
            debug!(path = %path.display(), pid, "Replacing stale pid file");
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("can't create {}", parent.display()))?;
        }
        fs::write(path, std::process::id().to_string())
            .with_context(|| format!("can't write pid file '{}'", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Can't remove pid file");
        }
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // kill(pid, 0) checks if the process exists without sending a signal
    if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_written_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("hostwatch.pid");

        let guard = PidFile::create(&path).unwrap();
        assert_eq!(
            fs::read_to_string(guard.path()).unwrap(),
            std::process::id().to_string()
        );
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn test_live_pid_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostwatch.pid");
        fs::write(&path, std::process::id().to_string()).unwrap();

        let err = PidFile::create(&path).unwrap_err();
        assert!(err.to_string().contains("already exists"), "{}", err);
        assert!(path.exists());
    }

    #[test]
    fn test_stale_or_garbage_pid_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostwatch.pid");

        for stale in ["999999999", "not a pid", ""] {
            fs::write(&path, stale).unwrap();
            let guard = PidFile::create(&path).unwrap();
            assert_eq!(
                fs::read_to_string(&path).unwrap(),
                std::process::id().to_string()
            );
            drop(guard);
        }
    }
}
