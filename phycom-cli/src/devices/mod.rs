//! Example devices.
//!
//! Each device receives an already connected [`DeviceConnection`] and
//! disconnects from the phy before returning. A phy that goes away, or
//! ctrl-c, ends the device normally.
//!
//! [`DeviceConnection`]: phycom_net::DeviceConnection

pub mod empty;
pub mod handbrake;
pub mod pause;
pub mod time_monitor;
