//! Single-instance guard backed by a pidfile

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("Failed to access pidfile {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Pidfile {path} does not contain a process id: '{contents}'")]
    Malformed { path: PathBuf, contents: String },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// Outcome of [`acquire`]
#[derive(Debug)]
pub enum Singleton {
    /// Another live process owns the pidfile
    Running(Pid),
    /// This process now owns the pidfile
    Acquired(PidFile),
}

/// A pidfile written by this process
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    removed: AtomicBool,
}

impl PidFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the pidfile. Only the first call does anything.
    pub fn remove(&self) {
        if self.removed.swap(true, Ordering::AcqRel) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Removed pidfile {}", self.path.display()),
            Err(e) => tracing::debug!("Failed to remove pidfile {}: {}", self.path.display(), e),
        }
    }
}

fn is_alive(pid: Pid) -> bool {
    // EPERM still means the process exists
    matches!(kill(pid, None), Ok(()) | Err(Errno::EPERM))
}

/// The live process recorded in `path`, if any. A missing file or a dead
/// process both yield `None`.
pub fn running_instance(path: &Path) -> Result<Option<Pid>, PidFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PidFileError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let pid = contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|&pid| pid > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| PidFileError::Malformed {
            path: path.to_path_buf(),
            contents: contents.trim().to_string(),
        })?;

    if pid != Pid::this() && is_alive(pid) {
        Ok(Some(pid))
    } else {
        tracing::debug!("Ignoring stale pidfile {} (pid {})", path.display(), pid);
        Ok(None)
    }
}

/// Claim `path` for this process unless another live instance holds it.
pub fn acquire(path: &Path) -> Result<Singleton, PidFileError> {
    if let Some(pid) = running_instance(path)? {
        return Ok(Singleton::Running(pid));
    }

    fs::write(path, Pid::this().to_string()).map_err(|source| PidFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("Wrote pidfile {}", path.display());

    Ok(Singleton::Acquired(PidFile {
        path: path.to_path_buf(),
        removed: AtomicBool::new(false),
    }))
}

/// Ask `pid` to shut down with SIGTERM.
pub fn terminate(pid: Pid) -> Result<(), PidFileError> {
    kill(pid, Signal::SIGTERM).map_err(|source| PidFileError::Signal { pid, source })?;
    tracing::info!("Sent SIGTERM to process {}", pid);
    Ok(())
}
