//! This library provides the communication layer between a phy and its
//! devices.
//!
//! A simulation is made up of independently launched processes: a single
//! phy, keeping the simulated clock, and a number of devices that advance in
//! lock-step with it. They talk over named pipes living in a directory shared
//! by everybody taking part in one simulation run.
//!
//!
//! # Constructs overview
//!
//! [`PhyConnection`] is the phy side. It attaches a fixed number of devices
//! at startup and then serves their requests, one channel per device.
//!
//! [`DeviceConnection`] is the device side, a single channel to the phy.
//! Devices synchronize by asking the phy to wake them at some simulated
//! time and blocking until it answers (see [`msg`] for the protocol).
//!
//! [`BackChannels`] lets devices exchange arbitrary framed messages with
//! each other, outside the timing protocol. It's mostly useful for test
//! setups where devices need to coordinate.
//!
//!
//! # Shared state
//!
//! Everything lives under `<tmp_root>/bs_<user>/<simulation_id>`. Lock files
//! guard against launching the same role twice in one run. Locks left
//! behind by crashed processes are detected and taken over.
//!
//! There is no process-wide state: each connection carries its own
//! [`ComConfig`], so any number of phys and devices can coexist in one
//! process.
//!
//!
//! # Stopping
//!
//! All blocking calls observe the [`CancelToken`] from their config. Signal
//! handlers should cancel the token and let the blocked call return.

#[macro_use]
extern crate log;

pub mod msg;

mod backchannel;
mod channel;
mod config;
mod device;
mod error;
mod lock;
mod namespace;
mod phy;
mod sig;

pub use backchannel::{BackChannels, ChannelId, PollStatus};
pub use channel::{ChannelPair, Fifo};
pub use config::{ComConfig, DEFAULT_TMP_ROOT};
pub use device::{ConnectionState, DeviceConnection, WaitOutcome};
pub use error::{Error, Result};
pub use lock::{process_start_time, LockFile, LockOwner};
pub use msg::{encode_message, MessageType, SimTime, WaitRequest, TIME_NEVER};
pub use namespace::Namespace;
pub use phy::PhyConnection;
pub use sig::CancelToken;
