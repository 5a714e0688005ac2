//! Shared filesystem namespace of a single simulation run.
//!
//! All participants of one simulation (the phy and every device) meet in
//! the same directory, `<tmp_root>/bs_<user>/<simulation_id>`. FIFOs and
//! lock files for that run all live directly inside it.
//!
//! Participants are launched independently, so any of them may be the
//! first one to get there. Creation and removal are therefore idempotent
//! and tolerate other processes racing on the same paths.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;
use nix::unistd::{geteuid, mkfifo, User};

use crate::config::ComConfig;
use crate::error::{Error, Result};

const DIR_MODE: u32 = 0o770;

/// Resolved communication directory for one simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    path: PathBuf,
}

impl Namespace {
    /// Resolves the namespace for `simulation_id`, creating the two
    /// directory levels if they are not there yet.
    pub fn resolve(config: &ComConfig, simulation_id: &str) -> Result<Self> {
        let user_dir = config.tmp_root.join(format!("bs_{}", user_name()?));
        create_dir_if_absent(&user_dir)?;
        let path = user_dir.join(simulation_id);
        if create_dir_if_absent(&path)? {
            warn!("created communication directory {:?}", path);
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of an entry inside the namespace.
    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Creates a FIFO named `name` inside the namespace unless it already
    /// exists, returning its path.
    pub fn fifo(&self, name: &str) -> Result<PathBuf> {
        let path = self.join(name);
        create_fifo_if_absent(&path)?;
        Ok(path)
    }

    /// Attempts to remove the namespace directory.
    ///
    /// This only succeeds once the last participant removed its files, so
    /// failure is expected and silently ignored.
    pub fn remove_if_empty(&self) {
        match std::fs::remove_dir(&self.path) {
            Ok(()) => debug!("removed communication directory {:?}", self.path),
            Err(e) => trace!("kept communication directory {:?}: {}", self.path, e),
        }
    }
}

/// Name of the effective user, used to keep users' namespaces apart.
pub(crate) fn user_name() -> Result<String> {
    match User::from_uid(geteuid())? {
        Some(user) => Ok(user.name),
        None => Err(Error::UnknownUser),
    }
}

/// Creates a single directory level, returns true if it was created by
/// this call.
///
/// Somebody else creating it first is not an error.
pub(crate) fn create_dir_if_absent(path: &Path) -> Result<bool> {
    match DirBuilder::new().mode(DIR_MODE).create(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(false),
        Err(e) => {
            warn!("can't create or access folder {:?}", path);
            Err(Error::resource("directory", path, e))
        }
    }
}

/// Creates a FIFO unless it's already there.
pub(crate) fn create_fifo_if_absent(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRWXU | Mode::S_IRWXG) {
        Ok(()) | Err(Errno::EEXIST) => Ok(()),
        Err(errno) => {
            warn!("can not create {:?}", path);
            Err(Error::resource("fifo", path, io::Error::from(errno)))
        }
    }
}
