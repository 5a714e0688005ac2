//! Phy side of the phy-device link.
//!
//! The phy owns one channel pair per device, addressed by the dense device
//! number `0..n_devices`. All devices are attached during
//! [`PhyConnection::initialize`], nobody can join later.
//!
//! Each device's channel is independent. Serving them in some order is up
//! to the caller.

use crate::channel::{dtp_name, ptd_name, ChannelPair};
use crate::config::ComConfig;
use crate::device::ConnectionState;
use crate::error::{Error, Result};
use crate::lock::LockFile;
use crate::msg::{
    encode_message, MessageType, SimTime, WaitRequest, HEADER_SIZE, WAIT_PAYLOAD_SIZE,
};
use crate::namespace::Namespace;

/// Per-device record. `pair` is `None` once the device is gone.
#[derive(Debug)]
struct DeviceSlot {
    number: u32,
    pair: Option<ChannelPair>,
}

/// Connection manager of the phy, serving a fixed set of devices.
#[derive(Debug)]
pub struct PhyConnection {
    config: ComConfig,
    state: ConnectionState,
    phy_id: String,
    namespace: Option<Namespace>,
    lock: Option<LockFile>,
    devices: Vec<DeviceSlot>,
}

impl PhyConnection {
    pub fn new() -> Self {
        Self::new_with_config(ComConfig::default())
    }

    pub fn new_with_config(config: ComConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Unconnected,
            phy_id: String::new(),
            namespace: None,
            lock: None,
            devices: Vec::new(),
        }
    }

    /// Attaches `n_devices` devices, waiting for each of them in turn.
    ///
    /// Either all devices end up connected or none do: on failure every
    /// already attached device is disconnected and the error is returned.
    /// Can only be called once.
    pub fn initialize(&mut self, simulation_id: &str, phy_id: &str, n_devices: u32) -> Result<()> {
        if self.state != ConnectionState::Unconnected {
            return Err(Error::AlreadyInitialized);
        }
        self.phy_id = phy_id.to_string();
        if let Err(e) = self.attach_devices(simulation_id, n_devices) {
            error!("phy {} failed to connect its devices: {}", phy_id, e);
            self.disconnect_all();
            return Err(e);
        }
        self.state = ConnectionState::Connected;
        info!(
            "phy {} connected to {} devices in simulation {}",
            phy_id, n_devices, simulation_id
        );
        Ok(())
    }

    fn attach_devices(&mut self, simulation_id: &str, n_devices: u32) -> Result<()> {
        let namespace = Namespace::resolve(&self.config, simulation_id)?;
        self.namespace = Some(namespace.clone());
        if self.config.use_lock_files {
            let lock_path = namespace.join(&format!("{}.phy.lock", self.phy_id));
            self.lock = Some(LockFile::acquire(lock_path)?);
        }
        self.devices.reserve(n_devices as usize);
        for number in 0..n_devices {
            let mut pair = ChannelPair::create(
                namespace.join(&dtp_name(&self.phy_id, number)),
                namespace.join(&ptd_name(&self.phy_id, number)),
            )?;
            debug!("waiting for device {}", number);
            pair.outbound_mut().open_write(&self.config, false)?;
            pair.inbound_mut().open_read()?;
            trace!("device {} attached", number);
            self.devices.push(DeviceSlot {
                number,
                pair: Some(pair),
            });
        }
        Ok(())
    }

    /// Blocks until device `d` sends its next request and returns its type.
    ///
    /// After `Wait` the caller must fetch the end time with
    /// [`read_wait_payload`](Self::read_wait_payload). After `Disconnect` or
    /// `Terminate` the device slot has been freed.
    ///
    /// A device that goes away without saying so shows up as `Disconnect`.
    pub fn next_request(&mut self, d: u32) -> Result<MessageType> {
        let pair = slot_pair(&mut self.devices, d)?;
        let mut header = [0; HEADER_SIZE];
        match pair.recv_exact(&mut header, &self.config) {
            Ok(()) => (),
            Err(Error::ShortRead { .. }) => {
                warn!("device {} left unexpectedly", d);
                self.free_device(d);
                return Ok(MessageType::Disconnect);
            }
            Err(Error::Cancelled) => {
                debug!("cancelled while waiting for device {}", d);
                self.free_device(d);
                return Ok(MessageType::Disconnect);
            }
            Err(e) => {
                self.free_device(d);
                return Err(e);
            }
        }
        let msg = match MessageType::from_bytes(header) {
            Ok(msg) => msg,
            Err(e) => {
                error!("device {} sent garbage: {}", d, e);
                self.free_device(d);
                return Err(e);
            }
        };
        match msg {
            MessageType::Wait => trace!("device {} wants to wait", d),
            MessageType::WaitEnd => {
                self.free_device(d);
                return Err(Error::UnexpectedMessage(msg));
            }
            MessageType::Disconnect => {
                info!("device {} disconnected", d);
                self.free_device(d);
            }
            MessageType::Terminate => {
                info!("device {} disconnected and asked to end the simulation", d);
                self.free_device(d);
            }
        }
        Ok(msg)
    }

    /// Reads the end time following a `Wait` header from device `d`.
    pub fn read_wait_payload(&mut self, d: u32) -> Result<SimTime> {
        let pair = slot_pair(&mut self.devices, d)?;
        let mut payload = [0; WAIT_PAYLOAD_SIZE];
        if let Err(e) = pair.recv_exact(&mut payload, &self.config) {
            warn!("device {} left in the middle of a wait request", d);
            self.free_device(d);
            return Err(e);
        }
        let end = WaitRequest::from_bytes(payload).end;
        trace!("device {} waits until {}", d, end);
        Ok(end)
    }

    /// Tells device `d` its requested time has been reached.
    pub fn respond_wait_end(&mut self, d: u32) -> Result<()> {
        let pair = slot_pair(&mut self.devices, d)?;
        if let Err(e) = pair.send(&MessageType::WaitEnd.to_bytes()) {
            debug!("couldn't respond to device {}: {}", d, e);
            self.free_device(d);
            return Err(e);
        }
        Ok(())
    }

    /// Sends a header with a custom payload to device `d` in one write.
    pub fn send_msg(&mut self, d: u32, msg: MessageType, payload: &[u8]) -> Result<()> {
        self.send_raw(d, &encode_message(msg, payload))
    }

    /// Sends raw bytes to device `d`.
    pub fn send_payload(&mut self, d: u32, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.send_raw(d, payload)
    }

    fn send_raw(&mut self, d: u32, bytes: &[u8]) -> Result<()> {
        let pair = slot_pair(&mut self.devices, d)?;
        if let Err(e) = pair.send(bytes) {
            debug!("couldn't send to device {}: {}", d, e);
            self.free_device(d);
            return Err(e);
        }
        Ok(())
    }

    /// Blocks until `buf` is filled with bytes from device `d`. If the device
    /// goes away first its slot is freed and the error returned.
    pub fn read(&mut self, d: u32, buf: &mut [u8]) -> Result<()> {
        let pair = slot_pair(&mut self.devices, d)?;
        if let Err(e) = pair.recv_exact(buf, &self.config) {
            warn!("failed reading from device {}: {}", d, e);
            self.free_device(d);
            return Err(e);
        }
        Ok(())
    }

    /// Closes the channel of device `d` and removes its pipes. Does nothing
    /// if the device is already gone.
    pub fn free_device(&mut self, d: u32) {
        if let Some(slot) = self.devices.get_mut(d as usize) {
            if let Some(mut pair) = slot.pair.take() {
                pair.tear_down();
                debug!("freed device {}", slot.number);
            }
        }
    }

    /// Sends `Disconnect` to every device still connected, frees all of
    /// them and cleans up the namespace. Repeated calls do nothing.
    pub fn disconnect_all(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        for slot in self.devices.iter_mut() {
            if let Some(mut pair) = slot.pair.take() {
                // the device may be long gone
                if let Err(e) = pair.send(&MessageType::Disconnect.to_bytes()) {
                    trace!("device {} didn't get the disconnect: {}", slot.number, e);
                }
                pair.tear_down();
            }
        }
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
        if let Some(namespace) = &self.namespace {
            namespace.remove_if_empty();
            info!("phy {} disconnected", self.phy_id);
        }
    }

    pub fn is_connected(&self, d: u32) -> bool {
        self.devices
            .get(d as usize)
            .map(|slot| slot.pair.is_some())
            .unwrap_or(false)
    }

    /// Number of devices the phy was initialized with.
    pub fn n_devices(&self) -> u32 {
        self.devices.len() as u32
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        self.namespace.as_ref()
    }

    pub fn config(&self) -> &ComConfig {
        &self.config
    }
}

impl Default for PhyConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PhyConnection {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}

fn slot_pair(devices: &mut [DeviceSlot], d: u32) -> Result<&mut ChannelPair> {
    devices
        .get_mut(d as usize)
        .and_then(|slot| slot.pair.as_mut())
        .ok_or(Error::NoSuchDevice(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn zero_devices() {
        let tmp = tempfile::tempdir().unwrap();
        let mut phy = PhyConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        phy.initialize("sim0", "2G4", 0).unwrap();
        assert_eq!(phy.n_devices(), 0);
        assert_eq!(phy.state(), ConnectionState::Connected);
        let lock = phy.namespace().unwrap().join("2G4.phy.lock");
        assert!(lock.exists());
        phy.disconnect_all();
        assert!(!lock.exists());
        assert!(!phy.namespace().unwrap().path().exists());
        phy.disconnect_all();
    }

    #[test]
    fn second_initialize_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut phy = PhyConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        phy.initialize("sim0", "2G4", 0).unwrap();
        assert!(matches!(
            phy.initialize("sim0", "2G4", 0),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn second_phy_with_same_id_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut first = PhyConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        first.initialize("sim0", "2G4", 0).unwrap();
        let mut second = PhyConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        let err = second.initialize("sim0", "2G4", 0).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(second.state(), ConnectionState::Disconnected);
        // the first phy's lock survives the failed attempt
        assert!(first.namespace().unwrap().join("2G4.phy.lock").exists());
    }

    #[test]
    fn lock_files_can_be_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ComConfig {
            use_lock_files: false,
            ..ComConfig::with_tmp_root(tmp.path())
        };
        let mut first = PhyConnection::new_with_config(config.clone());
        first.initialize("sim0", "2G4", 0).unwrap();
        assert!(!first.namespace().unwrap().join("2G4.phy.lock").exists());
        let mut second = PhyConnection::new_with_config(config);
        second.initialize("sim0", "2G4", 0).unwrap();
    }

    #[test]
    fn cancelled_initialize_rolls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ComConfig {
            poll_interval: Duration::from_millis(5),
            ..ComConfig::with_tmp_root(tmp.path())
        };
        let cancel = config.cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut phy = PhyConnection::new_with_config(config);
            let result = phy.initialize("sim0", "2G4", 2);
            (result, phy.namespace().cloned())
        });
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        let (result, namespace) = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        // pipes and lock are gone, and with them the directory
        assert!(!namespace.unwrap().path().exists());
    }

    #[test]
    fn unknown_device_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut phy = PhyConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        phy.initialize("sim0", "2G4", 0).unwrap();
        assert!(matches!(phy.next_request(0), Err(Error::NoSuchDevice(0))));
        assert!(matches!(phy.respond_wait_end(3), Err(Error::NoSuchDevice(3))));
        assert!(!phy.is_connected(0));
        phy.free_device(7);
    }
}
