/*!
 * PID file guard and the `--kill` action
 */

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{MirrorError, Result};

/// Holds the PID file for the lifetime of the process; removed on drop
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID to `path`, refusing if it names a live process
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(pid) = read_pid(&path)? {
            if process_alive(pid) {
                return Err(MirrorError::PidFile(format!(
                    "already running as pid {} ({})",
                    pid,
                    path.display()
                )));
            }
            info!("Removing stale PID file {} (pid {})", path.display(), pid);
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| pid_error(&path, e))?;
            }
        }
        fs::write(&path, format!("{}\n", std::process::id())).map_err(|e| pid_error(&path, e))?;
        debug!("Wrote PID file {}", path.display());
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove PID file {}: {}", self.path.display(), e);
        }
    }
}

fn pid_error(path: &Path, e: std::io::Error) -> MirrorError {
    MirrorError::PidFile(format!("{}: {}", path.display(), e))
}

/// PID recorded in `path`; `None` if there is no file.
///
/// Only positive pids are accepted: `kill` treats 0 and negative values as
/// process groups.
pub fn read_pid(path: &Path) -> Result<Option<i32>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(pid_error(path, e)),
    };
    match text.trim().parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(pid)),
        _ => Err(MirrorError::PidFile(format!(
            "{} does not hold a valid pid",
            path.display()
        ))),
    }
}

/// Send SIGTERM to the process named in `path`
pub fn kill_from_pidfile(path: &Path) -> Result<i32> {
    let pid = read_pid(path)?
        .ok_or_else(|| MirrorError::PidFile(format!("no PID file at {}", path.display())))?;
    send_terminate(pid)?;
    info!("Sent SIGTERM to {}", pid);
    Ok(pid)
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs permission and existence checks only
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(unix)]
fn send_terminate(pid: i32) -> Result<()> {
    // SAFETY: plain syscall on a pid read from our own PID file
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(MirrorError::PidFile(format!(
            "cannot signal {}: {}",
            pid,
            std::io::Error::last_os_error()
        )))
    }
}

#[cfg(not(unix))]
fn send_terminate(pid: i32) -> Result<()> {
    Err(MirrorError::PidFile(format!(
        "signalling pid {} is not supported on this platform",
        pid
    )))
}
