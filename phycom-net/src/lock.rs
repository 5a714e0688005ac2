//! Lock files guarding against two processes taking the same role in the
//! same simulation.
//!
//! A lock file records the pid of its owner and, where the platform lets
//! us find it, the owner's start time. The start time disambiguates pid
//! reuse: a live process with the recorded pid but a different start time
//! is not the owner.
//!
//! The lock exists only to reject an accidental double launch. It is not a
//! mutual exclusion primitive and two processes racing through
//! [`LockFile::acquire`] at the very same moment can both succeed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Contents of a lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: i32,
    /// Process start time as found in `/proc/<pid>/stat`; `None` where the
    /// platform doesn't expose it
    pub start_time: Option<u64>,
}

impl LockOwner {
    /// Owner record describing the calling process.
    pub fn current() -> Self {
        let pid = std::process::id() as i32;
        Self {
            pid,
            start_time: process_start_time(pid),
        }
    }

    fn to_file_contents(&self) -> String {
        match self.start_time {
            Some(start_time) => format!("{}\n{}\n", self.pid, start_time),
            None => format!("{}\n", self.pid),
        }
    }

    /// Parses lock file contents, `None` if they are corrupt.
    fn parse(contents: &str) -> Option<Self> {
        let mut lines = contents.lines().map(str::trim);
        let pid = lines.next()?.parse::<i32>().ok()?;
        if pid <= 0 {
            return None;
        }
        // the start time is missing when the writer couldn't find it
        let start_time = match lines.next() {
            None | Some("") => None,
            Some(line) => Some(line.parse::<u64>().ok()?),
        };
        Some(Self { pid, start_time })
    }

    /// Whether the recorded process is still running.
    ///
    /// When the start time can't be compared, a running process with the
    /// recorded pid is trusted to be the owner.
    fn is_alive(&self) -> bool {
        match kill(Pid::from_raw(self.pid), None) {
            Ok(()) | Err(Errno::EPERM) => (),
            Err(_) => return false,
        }
        match (self.start_time, process_start_time(self.pid)) {
            (Some(recorded), Some(actual)) => recorded == actual,
            _ => true,
        }
    }
}

/// Handle to an acquired lock file, released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: Option<PathBuf>,
}

impl LockFile {
    /// Takes the lock at `path`.
    ///
    /// Fails only if the existing lock belongs to a verified-live process,
    /// or if it can't be parsed. A lock left behind by a dead process is
    /// taken over.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match fs::read_to_string(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => (),
            Err(e) => return Err(Error::resource("lock file", path, e)),
            Ok(contents) => {
                warn!("previous lock file found {:?}", path);
                let owner = match LockOwner::parse(&contents) {
                    Some(owner) => owner,
                    None => {
                        warn!("found previous lock owned by unknown process, we may be racing each other");
                        return Err(Error::CorruptLock(path));
                    }
                };
                if owner.is_alive() {
                    warn!(
                        "found a previous, still running process with pid {} holding {:?}",
                        owner.pid, path
                    );
                    return Err(Error::LockConflict {
                        path,
                        pid: owner.pid,
                    });
                }
                warn!(
                    "found previous lock owned by dead process (pid was {}), taking over",
                    owner.pid
                );
            }
        }
        fs::write(&path, LockOwner::current().to_file_contents())
            .map_err(|e| Error::resource("lock file", &path, e))?;
        trace!("acquired lock {:?}", path);
        Ok(Self { path: Some(path) })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Deletes the lock file. Calling it again does nothing.
    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(e) = fs::remove_file(&path) {
                debug!("failed removing lock {:?}: {}", path, e);
            }
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.release();
    }
}

/// Start time of a process, in clock ticks since boot (field 22 of
/// `/proc/<pid>/stat`).
#[cfg(target_os = "linux")]
pub fn process_start_time(pid: i32) -> Option<u64> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // the executable name (field 2) may itself contain spaces or brackets
    let after_name = &stat[stat.rfind(')')? + 1..];
    after_name.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
pub fn process_start_time(_pid: i32) -> Option<u64> {
    None
}
