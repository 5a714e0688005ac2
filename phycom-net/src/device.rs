//! Device side of the phy-device link.

use crate::channel::{dtp_name, ptd_name, ChannelPair};
use crate::config::ComConfig;
use crate::error::{Error, Result};
use crate::lock::LockFile;
use crate::msg::{encode_message, MessageType, SimTime, WaitRequest, HEADER_SIZE};
use crate::namespace::Namespace;

/// Lifecycle of a connection.
///
/// `Disconnected` is terminal, a connection can't be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connected,
    Disconnected,
}

/// Result of waiting for the phy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The requested simulated time was reached
    Reached,
    /// The phy is gone, the connection has been cleaned up
    Disconnected,
}

/// Connection of a single device to its phy.
#[derive(Debug)]
pub struct DeviceConnection {
    config: ComConfig,
    state: ConnectionState,
    device_number: Option<u32>,
    namespace: Option<Namespace>,
    lock: Option<LockFile>,
    pair: Option<ChannelPair>,
    back_channels_opened: bool,
}

impl DeviceConnection {
    pub fn new() -> Self {
        Self::new_with_config(ComConfig::default())
    }

    pub fn new_with_config(config: ComConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Unconnected,
            device_number: None,
            namespace: None,
            lock: None,
            pair: None,
            back_channels_opened: false,
        }
    }

    /// Connects to phy `phy_id` of the given simulation as device number
    /// `device_number`, blocking until the phy is there.
    ///
    /// Only one connection attempt is allowed. If it fails the connection
    /// is cleaned up and stays disconnected.
    pub fn connect(&mut self, simulation_id: &str, phy_id: &str, device_number: u32) -> Result<()> {
        if self.state != ConnectionState::Unconnected {
            return Err(Error::AlreadyInitialized);
        }
        self.device_number = Some(device_number);
        if let Err(e) = self.open(simulation_id, phy_id, device_number) {
            debug!("device {} failed to connect: {}", device_number, e);
            self.clean_up();
            return Err(e);
        }
        self.state = ConnectionState::Connected;
        info!(
            "device {} connected to phy {} in simulation {}",
            device_number, phy_id, simulation_id
        );
        Ok(())
    }

    fn open(&mut self, simulation_id: &str, phy_id: &str, d: u32) -> Result<()> {
        let namespace = Namespace::resolve(&self.config, simulation_id)?;
        self.namespace = Some(namespace.clone());
        if self.config.use_lock_files {
            let lock_path = namespace.join(&format!("{}.d{}.lock", phy_id, d));
            self.lock = Some(LockFile::acquire(lock_path)?);
        }
        let mut pair = ChannelPair::create(
            namespace.join(&ptd_name(phy_id, d)),
            namespace.join(&dtp_name(phy_id, d)),
        )?;
        pair.inbound_mut().open_read()?;
        pair.outbound_mut().open_write(&self.config, false)?;
        self.pair = Some(pair);
        Ok(())
    }

    /// Queues a wait request without waiting for the answer.
    ///
    /// Every request must later be matched by one call to
    /// [`collect_wait_response`](Self::collect_wait_response), answers come
    /// back in request order.
    pub fn request_wait_nonblocking(&mut self, end: SimTime) -> Result<()> {
        let pair = self.pair.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = pair.send(&WaitRequest::new(end).to_message()) {
            debug!("wait request failed: {}", e);
            self.clean_up();
            return Err(e);
        }
        trace!("requested wait until {}", end);
        Ok(())
    }

    /// Blocks until the phy answers the oldest outstanding wait request.
    ///
    /// A phy that disconnects, or just goes away, is reported as
    /// [`WaitOutcome::Disconnected`], and so is cancellation.
    pub fn collect_wait_response(&mut self) -> Result<WaitOutcome> {
        let pair = self.pair.as_mut().ok_or(Error::NotConnected)?;
        let mut header = [0; HEADER_SIZE];
        match pair.recv_exact(&mut header, &self.config) {
            Ok(()) => (),
            Err(Error::ShortRead { .. }) | Err(Error::Cancelled) => {
                debug!("phy went away while we were waiting");
                self.clean_up();
                return Ok(WaitOutcome::Disconnected);
            }
            Err(e) => {
                self.clean_up();
                return Err(e);
            }
        }
        match MessageType::from_bytes(header) {
            Ok(MessageType::WaitEnd) => Ok(WaitOutcome::Reached),
            Ok(MessageType::Disconnect) => {
                info!("phy disconnected");
                self.clean_up();
                Ok(WaitOutcome::Disconnected)
            }
            Ok(other) => {
                error!("phy sent unexpected {:?}", other);
                self.clean_up();
                Err(Error::UnexpectedMessage(other))
            }
            Err(e) => {
                error!("phy sent garbage: {}", e);
                self.clean_up();
                Err(e)
            }
        }
    }

    /// Waits until simulated time `end` is reached.
    pub fn request_wait_blocking(&mut self, end: SimTime) -> Result<WaitOutcome> {
        match self.request_wait_nonblocking(end) {
            Ok(()) => self.collect_wait_response(),
            Err(Error::PeerLost) => Ok(WaitOutcome::Disconnected),
            Err(e) => Err(e),
        }
    }

    /// Sends a header with a custom payload in one write, for protocols
    /// layered on top of the wait protocol.
    pub fn send_msg(&mut self, msg: MessageType, payload: &[u8]) -> Result<()> {
        self.send_raw(&encode_message(msg, payload))
    }

    /// Sends raw bytes to the phy.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Ok(());
        }
        self.send_raw(payload)
    }

    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let pair = self.pair.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = pair.send(bytes) {
            debug!("sending to phy failed: {}", e);
            self.clean_up();
            return Err(e);
        }
        trace!("sent {} bytes to phy", bytes.len());
        Ok(())
    }

    /// Blocks until `buf` is filled with bytes from the phy.
    ///
    /// If the phy goes away first, or the read is cancelled, the connection
    /// is cleaned up and the error returned.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<()> {
        let pair = self.pair.as_mut().ok_or(Error::NotConnected)?;
        if let Err(e) = pair.recv_exact(buf, &self.config) {
            warn!("failed reading from phy: {}", e);
            self.clean_up();
            return Err(e);
        }
        Ok(())
    }

    /// Tells the phy we're leaving and cleans up. Doesn't wait for any
    /// acknowledgement.
    pub fn disconnect(&mut self) {
        self.say_goodbye(MessageType::Disconnect);
    }

    /// Like [`disconnect`](Self::disconnect), additionally asking for the
    /// whole simulation to end.
    pub fn terminate(&mut self) {
        self.say_goodbye(MessageType::Terminate);
    }

    fn say_goodbye(&mut self, msg: MessageType) {
        if let Some(pair) = self.pair.as_mut() {
            match pair.send(&msg.to_bytes()) {
                Ok(()) => debug!("sent {:?} to phy", msg),
                Err(e) => debug!("phy didn't get {:?}: {}", msg, e),
            }
        }
        self.clean_up();
    }

    /// Removes pipes and lock file, and the namespace directory if nobody
    /// else uses it. Calling it again does nothing.
    pub fn clean_up(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Disconnected;
        if let Some(mut pair) = self.pair.take() {
            pair.tear_down();
        }
        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }
        if let Some(namespace) = &self.namespace {
            namespace.remove_if_empty();
        }
        if let Some(d) = self.device_number {
            info!("device {} disconnected", d);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device_number(&self) -> Option<u32> {
        self.device_number
    }

    pub fn namespace(&self) -> Option<&Namespace> {
        self.namespace.as_ref()
    }

    pub fn config(&self) -> &ComConfig {
        &self.config
    }

    /// Marks back channels as opened, failing if that already happened.
    pub(crate) fn claim_back_channels(&mut self) -> Result<()> {
        if self.back_channels_opened {
            return Err(Error::BackChannelsAlreadyOpen);
        }
        self.back_channels_opened = true;
        Ok(())
    }
}

impl Default for DeviceConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.clean_up();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn calls_before_connect_fail() {
        let mut device = DeviceConnection::new();
        assert_eq!(device.state(), ConnectionState::Unconnected);
        assert!(matches!(
            device.request_wait_nonblocking(10),
            Err(Error::NotConnected)
        ));
        assert!(matches!(
            device.collect_wait_response(),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn clean_up_is_idempotent_and_terminal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut device = DeviceConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        device.clean_up();
        device.clean_up();
        device.disconnect();
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(matches!(
            device.connect("sim0", "2G4", 0),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn cancelled_connect_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let config = ComConfig {
            poll_interval: Duration::from_millis(5),
            ..ComConfig::with_tmp_root(tmp.path())
        };
        let cancel = config.cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut device = DeviceConnection::new_with_config(config);
            let result = device.connect("sim0", "2G4", 4);
            (result, device.state(), device.namespace().cloned())
        });
        std::thread::sleep(Duration::from_millis(30));
        cancel.cancel();
        let (result, state, namespace) = handle.join().unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(!namespace.unwrap().path().exists());
    }

    #[test]
    fn device_lock_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let ns = Namespace::resolve(&ComConfig::with_tmp_root(tmp.path()), "sim0").unwrap();
        let _held = LockFile::acquire(ns.join("2G4.d1.lock")).unwrap();
        let mut device = DeviceConnection::new_with_config(ComConfig::with_tmp_root(tmp.path()));
        let err = device.connect("sim0", "2G4", 1).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(device.state(), ConnectionState::Disconnected);
        assert!(!ns.join("2G4.d1.ptd").exists());
    }
}
