use std::io;
use std::path::PathBuf;

use num_enum::TryFromPrimitiveError;
use thiserror::Error;

use crate::msg::MessageType;

pub type Result<T> = core::result::Result<T, Error>;

/// Enumeration of errors that may occur during phy-device communication.
#[derive(Error, Debug)]
pub enum Error {
    #[error("can't create or access {what} {path:?}: {source}")]
    Resource {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("couldn't resolve the user name for the communication directory")]
    UnknownUser,

    #[error("lock {path:?} is held by running process with pid {pid}")]
    LockConflict { path: PathBuf, pid: i32 },
    #[error("lock {0:?} is owned by an unknown process, we may be racing each other")]
    CorruptLock(PathBuf),

    #[error("unknown message code: {0}")]
    UnknownMsgCode(#[from] TryFromPrimitiveError<MessageType>),
    #[error("unexpected message: {0:?}")]
    UnexpectedMessage(MessageType),
    #[error("short read: tried to get {expected} bytes, got {got}")]
    ShortRead { expected: usize, got: usize },
    #[error("short write: tried to put {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },

    #[error("back channel {channel} filled up ({written} of {size} bytes accepted)")]
    ChannelFull {
        channel: usize,
        written: usize,
        size: usize,
    },
    #[error("back channel {channel} broken: {detail}")]
    ChannelBroken { channel: usize, detail: String },
    #[error("back channel {channel} has {pending} pending bytes, tried to receive {requested}")]
    ReceiveTooLarge {
        channel: usize,
        requested: usize,
        pending: usize,
    },

    #[error("peer disconnected")]
    PeerLost,
    #[error("operation cancelled")]
    Cancelled,

    #[error("already initialized")]
    AlreadyInitialized,
    #[error("not connected")]
    NotConnected,
    #[error("no connected device with number {0}")]
    NoSuchDevice(u32),
    #[error("no back channel with id {0}")]
    NoSuchChannel(usize),
    #[error("back channels can only be opened once per device connection")]
    BackChannelsAlreadyOpen,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("os error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Another live participant already holds the requested role.
    ///
    /// A lock file that can't be parsed counts as a conflict too.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::LockConflict { .. } | Error::CorruptLock(_))
    }

    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::UnknownMsgCode(_)
                | Error::UnexpectedMessage(_)
                | Error::ShortRead { .. }
                | Error::ShortWrite { .. }
                | Error::ChannelFull { .. }
                | Error::ChannelBroken { .. }
                | Error::ReceiveTooLarge { .. }
        )
    }

    pub fn is_peer_lost(&self) -> bool {
        matches!(self, Error::PeerLost)
    }

    pub(crate) fn resource(what: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::Resource {
            what,
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(Error::CorruptLock(PathBuf::from("x.lock")).is_conflict());
        assert!(Error::LockConflict {
            path: PathBuf::from("x.lock"),
            pid: 1
        }
        .is_conflict());
        assert!(Error::ShortRead {
            expected: 4,
            got: 0
        }
        .is_protocol());
        assert!(Error::PeerLost.is_peer_lost());
        assert!(!Error::PeerLost.is_protocol());
        assert!(!Error::Cancelled.is_conflict());
    }
}
