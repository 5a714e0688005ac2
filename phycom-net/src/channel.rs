//! Named pipe endpoints and the bidirectional channel pair built from them.
//!
//! # Opening
//!
//! Read ends are opened without waiting for a writer. Write ends wait until
//! the peer has opened the matching read end, which is the rendezvous that
//! guarantees both sides exist before anything is sent. The wait is done by
//! retrying a non-blocking open every `open_retry_interval` so that it can
//! be cancelled.
//!
//! # Reading
//!
//! Read ends stay non-blocking. Blocking reads poll the descriptor in
//! slices of `poll_interval`, checking the cancel token in between.

use std::convert::TryFrom;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::config::ComConfig;
use crate::error::{Error, Result};
use crate::namespace::create_fifo_if_absent;

/// What a non-blocking look at a read end found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Data is waiting
    Readable,
    /// No data, and the writer went away
    HungUp,
    /// Nothing yet
    Idle,
}

/// One end of a named pipe, together with its path.
///
/// The pipe file is deleted when the endpoint is removed or dropped.
#[derive(Debug)]
pub struct Fifo {
    path: PathBuf,
    file: Option<File>,
    removed: bool,
}

impl Fifo {
    /// Creates the named pipe at `path` unless it exists already.
    pub fn create(path: PathBuf) -> Result<Self> {
        create_fifo_if_absent(&path)?;
        Ok(Self {
            path,
            file: None,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Opens the read end. Doesn't wait for a writer.
    pub fn open_read(&mut self) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| Error::resource("fifo", &self.path, e))?;
        self.file = Some(file);
        Ok(())
    }

    /// Opens the write end, waiting until somebody opened the read end.
    ///
    /// With `nonblocking` set, later writes that don't fit in the pipe fail
    /// instead of waiting.
    pub fn open_write(&mut self, config: &ComConfig, nonblocking: bool) -> Result<()> {
        loop {
            if config.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&self.path)
            {
                Ok(file) => {
                    if !nonblocking {
                        set_nonblocking(&file, false)?;
                    }
                    self.file = Some(file);
                    return Ok(());
                }
                // no reader yet
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    thread::sleep(config.open_retry_interval)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(Error::resource("fifo", &self.path, e)),
            }
        }
    }

    /// Blocks until `buf` is full or the writer goes away.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()`
    /// only if the pipe reached end-of-file.
    pub fn read_full(&mut self, buf: &mut [u8], config: &ComConfig) -> Result<usize> {
        let file = self.file.as_mut().ok_or(Error::NotConnected)?;
        let mut filled = 0;
        while filled < buf.len() {
            if config.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if wait_readiness(file, config.poll_interval)? == Readiness::Idle {
                continue;
            }
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_transient(&e) => (),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(filled)
    }

    /// Single read attempt without waiting.
    pub(crate) fn try_read(&mut self, buf: &mut [u8]) -> Result<io::Result<usize>> {
        let file = self.file.as_mut().ok_or(Error::NotConnected)?;
        Ok(file.read(buf))
    }

    /// Single write attempt, the pipe decides how much is accepted.
    pub(crate) fn try_write(&mut self, buf: &[u8]) -> Result<io::Result<usize>> {
        let file = self.file.as_mut().ok_or(Error::NotConnected)?;
        Ok(file.write(buf))
    }

    /// Checks the read end without waiting.
    pub(crate) fn readiness(&self) -> Result<Readiness> {
        let file = self.file.as_ref().ok_or(Error::NotConnected)?;
        wait_readiness(file, Duration::from_millis(0))
    }

    /// Writes the whole buffer.
    ///
    /// Messages up to the pipe's atomic write size never interleave with
    /// other writers.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::NotConnected)?;
        match file.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(Error::PeerLost),
            Err(e) if e.kind() == io::ErrorKind::WriteZero => Err(Error::ShortWrite {
                expected: buf.len(),
                written: 0,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Closes the descriptor, keeping the pipe file.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Closes the descriptor and deletes the pipe file. Repeated calls do
    /// nothing.
    pub fn remove(&mut self) {
        self.close();
        if !self.removed {
            self.removed = true;
            match std::fs::remove_file(&self.path) {
                Ok(()) => trace!("removed fifo {:?}", self.path),
                // the peer got there first
                Err(e) if e.kind() == io::ErrorKind::NotFound => (),
                Err(e) => debug!("failed removing fifo {:?}: {}", self.path, e),
            }
        }
    }
}

impl Drop for Fifo {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Two unidirectional named pipes forming one bidirectional link.
#[derive(Debug)]
pub struct ChannelPair {
    inbound: Fifo,
    outbound: Fifo,
}

impl ChannelPair {
    /// Creates (if needed) both pipe files. Nothing is opened yet.
    pub fn create(inbound: PathBuf, outbound: PathBuf) -> Result<Self> {
        Ok(Self {
            inbound: Fifo::create(inbound)?,
            outbound: Fifo::create(outbound)?,
        })
    }

    pub fn inbound(&self) -> &Fifo {
        &self.inbound
    }

    pub fn outbound(&self) -> &Fifo {
        &self.outbound
    }

    pub fn inbound_mut(&mut self) -> &mut Fifo {
        &mut self.inbound
    }

    pub fn outbound_mut(&mut self) -> &mut Fifo {
        &mut self.outbound
    }

    pub fn is_open(&self) -> bool {
        self.inbound.is_open() && self.outbound.is_open()
    }

    /// Sends a complete message.
    pub fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.outbound.write_all(bytes)
    }

    /// Receives exactly `buf.len()` bytes, blocking until they arrive.
    ///
    /// End-of-file before the buffer is full is a short read.
    pub fn recv_exact(&mut self, buf: &mut [u8], config: &ComConfig) -> Result<()> {
        let got = self.inbound.read_full(buf, config)?;
        if got < buf.len() {
            return Err(Error::ShortRead {
                expected: buf.len(),
                got,
            });
        }
        Ok(())
    }

    /// Closes both pipes and deletes their files.
    pub fn tear_down(&mut self) {
        self.inbound.remove();
        self.outbound.remove();
    }
}

/// Name of the device-to-phy pipe of device `d`.
pub(crate) fn dtp_name(phy_id: &str, d: u32) -> String {
    format!("{}.d{}.dtp", phy_id, d)
}

/// Name of the phy-to-device pipe of device `d`.
pub(crate) fn ptd_name(phy_id: &str, d: u32) -> String {
    format!("{}.d{}.ptd", phy_id, d)
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn set_nonblocking(file: &File, nonblocking: bool) -> Result<()> {
    let fd = file.as_raw_fd();
    let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

fn wait_readiness(file: &File, timeout: Duration) -> Result<Readiness> {
    let millis = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    let mut fds = [PollFd::new(file.as_fd(), PollFlags::POLLIN)];
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) | Err(Errno::EINTR) => return Ok(Readiness::Idle),
        Ok(_) => (),
        Err(e) => return Err(e.into()),
    }
    let revents = fds[0].revents().unwrap_or_else(PollFlags::empty);
    if revents.contains(PollFlags::POLLIN) {
        Ok(Readiness::Readable)
    } else if revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
        Ok(Readiness::HungUp)
    } else {
        Ok(Readiness::Idle)
    }
}
