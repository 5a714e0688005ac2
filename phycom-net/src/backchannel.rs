//! Framed side channels between pairs of devices, independent of the
//! wait protocol.
//!
//! Each logical channel is identified by the peer device and a channel
//! number, and backed by its own pair of named pipes:
//!
//! ```text
//! Device<self>_from<peer>_<chan>.bc   inbound
//! Device<peer>_from<self>_<chan>.bc   outbound
//! ```
//!
//! Frames are a 4 byte native endian length followed by that many payload
//! bytes. Everything here is non-blocking once the channels are open.
//!
//! # Sizing
//!
//! A frame goes out in a single write and a frame that doesn't fit in the
//! pipe is an error, not something to retry. Keep frames below the atomic
//! pipe write size (`PIPE_BUF`, 4 KiB on Linux) minus the 4 length bytes,
//! and don't let more than the pipe capacity (64 KiB by default) pile up
//! unread.

use std::convert::TryFrom;
use std::io;

use byteorder::{ByteOrder, NativeEndian};

use crate::channel::{ChannelPair, Readiness};
use crate::config::ComConfig;
use crate::device::DeviceConnection;
use crate::error::{Error, Result};
use crate::namespace::Namespace;

/// Index of a channel within [`BackChannels`], in the order the channels
/// were requested.
pub type ChannelId = usize;

const LENGTH_SIZE: usize = 4;

/// What [`BackChannels::poll`] found on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing to read right now
    Empty,
    /// The peer closed its end, nothing more will arrive
    Closed,
    /// A frame with this many payload bytes is waiting
    Available(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    None,
    Bytes(usize),
    Closed,
}

#[derive(Debug)]
struct BackChannel {
    peer: u32,
    number: u32,
    pair: ChannelPair,
    pending: Pending,
}

/// The set of back channels of one device.
#[derive(Debug)]
pub struct BackChannels {
    config: ComConfig,
    namespace: Namespace,
    channels: Vec<BackChannel>,
}

impl BackChannels {
    /// Opens one channel per `(peer, channel number)` entry of `links`.
    ///
    /// Blocks until every peer has opened its side. The peers must open the
    /// matching channels with a single call as well. All inbound pipes are
    /// opened before any outbound one so that two devices opening channels
    /// towards each other can't deadlock.
    ///
    /// The device must be connected to its phy, and this can be done only
    /// once per device connection.
    pub fn open(device: &mut DeviceConnection, links: &[(u32, u32)]) -> Result<Self> {
        if !device.is_connected() {
            return Err(Error::NotConnected);
        }
        let own = device.device_number().ok_or(Error::NotConnected)?;
        let namespace = device.namespace().cloned().ok_or(Error::NotConnected)?;
        device.claim_back_channels()?;

        // dropping a partially opened set removes its pipes
        let mut opened = Self {
            config: device.config().clone(),
            namespace,
            channels: Vec::with_capacity(links.len()),
        };
        for &(peer, number) in links {
            let pair = ChannelPair::create(
                opened.namespace.join(&pipe_name(own, peer, number)),
                opened.namespace.join(&pipe_name(peer, own, number)),
            )?;
            opened.channels.push(BackChannel {
                peer,
                number,
                pair,
                pending: Pending::None,
            });
        }
        for channel in opened.channels.iter_mut() {
            channel.pair.inbound_mut().open_read()?;
        }
        for channel in opened.channels.iter_mut() {
            channel.pair.outbound_mut().open_write(&opened.config, true)?;
            debug!(
                "opened back channel {} with device {}",
                channel.number, channel.peer
            );
        }
        Ok(opened)
    }

    /// Id of the channel with `peer` numbered `number`.
    pub fn channel_id(&self, peer: u32, number: u32) -> Option<ChannelId> {
        self.channels
            .iter()
            .position(|c| c.peer == peer && c.number == number)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Sends `data` as one frame.
    ///
    /// Fails with [`Error::ChannelFull`] if the pipe doesn't take the whole
    /// frame at once.
    pub fn send(&mut self, id: ChannelId, data: &[u8]) -> Result<()> {
        let channel = self.channels.get_mut(id).ok_or(Error::NoSuchChannel(id))?;
        let size = LENGTH_SIZE + data.len();
        let len = u32::try_from(data.len()).map_err(|_| Error::ChannelFull {
            channel: id,
            written: 0,
            size,
        })?;
        let mut frame = vec![0; LENGTH_SIZE];
        NativeEndian::write_u32(&mut frame, len);
        frame.extend_from_slice(data);
        loop {
            match channel.pair.outbound_mut().try_write(&frame)? {
                Ok(written) if written == size => {
                    trace!("sent {} bytes on back channel {}", data.len(), id);
                    return Ok(());
                }
                Ok(written) => {
                    return Err(Error::ChannelFull {
                        channel: id,
                        written,
                        size,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(Error::ChannelFull {
                        channel: id,
                        written: 0,
                        size,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Err(Error::PeerLost),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Checks whether a frame is waiting on channel `id`, without blocking.
    ///
    /// Once a frame's size is known it's reported until its payload has
    /// been received.
    pub fn poll(&mut self, id: ChannelId) -> Result<PollStatus> {
        let channel = self.channels.get_mut(id).ok_or(Error::NoSuchChannel(id))?;
        match channel.pending {
            Pending::Bytes(size) => return Ok(PollStatus::Available(size)),
            Pending::Closed => return Ok(PollStatus::Closed),
            Pending::None => (),
        }
        let mut header = [0; LENGTH_SIZE];
        loop {
            match channel.pair.inbound().readiness()? {
                Readiness::Idle => return Ok(PollStatus::Empty),
                Readiness::HungUp => {
                    debug!("back channel {} closed by device {}", id, channel.peer);
                    channel.pending = Pending::Closed;
                    return Ok(PollStatus::Closed);
                }
                Readiness::Readable => (),
            }
            match channel.pair.inbound_mut().try_read(&mut header)? {
                Ok(0) => {
                    channel.pending = Pending::Closed;
                    return Ok(PollStatus::Closed);
                }
                Ok(LENGTH_SIZE) => {
                    let size = NativeEndian::read_u32(&header) as usize;
                    channel.pending = Pending::Bytes(size);
                    return Ok(PollStatus::Available(size));
                }
                Ok(got) => {
                    return Err(Error::ChannelBroken {
                        channel: id,
                        detail: format!("got {} of {} length bytes", got, LENGTH_SIZE),
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    warn!("reading back channel {} interrupted by a signal, retrying", id);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(PollStatus::Empty),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fills `buf` with payload of the frame announced by the last
    /// [`poll`](Self::poll).
    ///
    /// `buf` can't be larger than the pending payload. A frame can be
    /// consumed in several smaller pieces.
    pub fn receive(&mut self, id: ChannelId, buf: &mut [u8]) -> Result<()> {
        let channel = self.channels.get_mut(id).ok_or(Error::NoSuchChannel(id))?;
        let pending = match channel.pending {
            Pending::Bytes(size) => size,
            _ => 0,
        };
        if buf.len() > pending {
            return Err(Error::ReceiveTooLarge {
                channel: id,
                requested: buf.len(),
                pending,
            });
        }
        let mut filled = 0;
        while filled < buf.len() {
            match channel.pair.inbound_mut().try_read(&mut buf[filled..])? {
                Ok(0) => {
                    return Err(Error::ChannelBroken {
                        channel: id,
                        detail: format!(
                            "device {} left in the middle of a message ({} of {} bytes)",
                            channel.peer,
                            filled,
                            buf.len()
                        ),
                    })
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Err(Error::ChannelBroken {
                        channel: id,
                        detail: format!("message cut short ({} of {} bytes)", filled, buf.len()),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
        channel.pending = match pending - buf.len() {
            0 => Pending::None,
            rest => Pending::Bytes(rest),
        };
        Ok(())
    }

    /// Closes every channel and removes its pipes, and the namespace
    /// directory if nobody else uses it. Calling it again does nothing.
    pub fn clean_up(&mut self) {
        for channel in self.channels.iter_mut() {
            channel.pair.tear_down();
        }
        self.namespace.remove_if_empty();
    }
}

impl Drop for BackChannels {
    fn drop(&mut self) {
        self.clean_up();
    }
}

fn pipe_name(to: u32, from: u32, number: u32) -> String {
    format!("Device{}_from{}_{}.bc", to, from, number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_names_follow_direction() {
        assert_eq!(pipe_name(1, 0, 3), "Device1_from0_3.bc");
        assert_eq!(pipe_name(0, 1, 3), "Device0_from1_3.bc");
    }

    #[test]
    fn open_requires_connected_device() {
        let mut device = DeviceConnection::new();
        assert!(matches!(
            BackChannels::open(&mut device, &[(1, 0)]),
            Err(Error::NotConnected)
        ));
    }
}
