//! Wait/disconnect protocol spoken between the phy and its devices.
//!
//! # Wire format
//!
//! Every message starts with a 4 byte native endian tag. Only `Wait` carries
//! a payload: the 8 byte native endian simulated time at which the device
//! wants to be woken up.
//!
//! ```text
//! device -> phy   Wait (0x01) + end time | Disconnect (0xFFFF) | Terminate (0xFFFE)
//! phy -> device   WaitEnd (0x81)         | Disconnect (0xFFFF)
//! ```
//!
//! Requests carry no identifier. A device may queue several `Wait`s before
//! reading any response, and the n-th `WaitEnd` answers the n-th `Wait`.
//!
//! `Terminate` tears the channel down just like `Disconnect`, it additionally
//! asks whoever orchestrates the simulation to end it early.

use std::convert::TryFrom;

use byteorder::{ByteOrder, NativeEndian};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::Result;

/// Simulated time, in microseconds.
pub type SimTime = u64;

/// Simulated time that is never reached.
pub const TIME_NEVER: SimTime = u64::MAX;

pub const HEADER_SIZE: usize = 4;
pub const WAIT_PAYLOAD_SIZE: usize = 8;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum MessageType {
    /// The device has nothing to do until the attached time
    Wait = 0x01,
    /// The requested time has been reached
    WaitEnd = 0x81,
    /// The device is disconnecting and asks to end the simulation
    Terminate = 0xFFFE,
    /// Either side is disconnecting
    Disconnect = 0xFFFF,
}

impl MessageType {
    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0; HEADER_SIZE];
        NativeEndian::write_u32(&mut buf, self.into());
        buf
    }

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Result<Self> {
        Ok(Self::try_from(NativeEndian::read_u32(&bytes))?)
    }

    /// Whether receiving this message ends the session on that channel.
    pub fn ends_session(self) -> bool {
        matches!(self, MessageType::Disconnect | MessageType::Terminate)
    }
}

/// Header followed by an arbitrary payload, ready for a single write.
pub fn encode_message(msg: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&msg.to_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Payload following a `Wait` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRequest {
    pub end: SimTime,
}

impl WaitRequest {
    pub fn new(end: SimTime) -> Self {
        Self { end }
    }

    pub fn from_bytes(bytes: [u8; WAIT_PAYLOAD_SIZE]) -> Self {
        Self {
            end: NativeEndian::read_u64(&bytes),
        }
    }

    /// Complete message: header followed by the payload, in one buffer so
    /// it can go out in a single write.
    pub fn to_message(&self) -> [u8; HEADER_SIZE + WAIT_PAYLOAD_SIZE] {
        let mut buf = [0; HEADER_SIZE + WAIT_PAYLOAD_SIZE];
        buf[..HEADER_SIZE].copy_from_slice(&MessageType::Wait.to_bytes());
        NativeEndian::write_u64(&mut buf[HEADER_SIZE..], self.end);
        buf
    }
}
