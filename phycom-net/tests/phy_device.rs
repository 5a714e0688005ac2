//! Phy and devices talking to each other, each running in its own thread.

use std::thread;
use std::time::Duration;

use phycom_net::{
    CancelToken, ComConfig, ConnectionState, DeviceConnection, Error, MessageType, Namespace,
    PhyConnection, WaitOutcome,
};
use tempfile::TempDir;

fn config(tmp: &TempDir) -> ComConfig {
    ComConfig {
        poll_interval: Duration::from_millis(5),
        ..ComConfig::with_tmp_root(tmp.path())
    }
}

/// Same settings, but with a cancel token of its own.
fn separate(config: &ComConfig) -> ComConfig {
    ComConfig {
        cancel: CancelToken::new(),
        ..config.clone()
    }
}

#[test]
fn wait_then_disconnect() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);
    let ns = Namespace::resolve(&config, "s1").unwrap();

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s1", "2G4", 1).unwrap();
        assert!(phy.is_connected(0));
        assert_eq!(phy.next_request(0).unwrap(), MessageType::Wait);
        assert_eq!(phy.read_wait_payload(0).unwrap(), 1000);
        phy.respond_wait_end(0).unwrap();
        assert_eq!(phy.next_request(0).unwrap(), MessageType::Disconnect);
        assert!(!phy.is_connected(0));
        phy
    });

    let mut device = DeviceConnection::new_with_config(config);
    device.connect("s1", "2G4", 0).unwrap();
    assert!(device.is_connected());
    assert_eq!(device.device_number(), Some(0));
    assert!(ns.join("2G4.d0.lock").exists());
    assert_eq!(
        device.request_wait_blocking(1000).unwrap(),
        WaitOutcome::Reached
    );
    device.disconnect();
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(!ns.join("2G4.d0.lock").exists());

    let mut phy = phy.join().unwrap();
    assert!(!ns.join("2G4.d0.dtp").exists());
    assert!(!ns.join("2G4.d0.ptd").exists());
    phy.disconnect_all();
    assert!(!ns.path().exists());

    // second round of cleanup is harmless
    phy.disconnect_all();
    device.clean_up();
    device.disconnect();
}

#[test]
fn pipelined_requests_are_answered_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s1", "2G4", 1).unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            assert_eq!(phy.next_request(0).unwrap(), MessageType::Wait);
            seen.push(phy.read_wait_payload(0).unwrap());
        }
        // answer only the first request
        phy.respond_wait_end(0).unwrap();
        phy.disconnect_all();
        seen
    });

    let mut device = DeviceConnection::new_with_config(config);
    device.connect("s1", "2G4", 0).unwrap();
    device.request_wait_nonblocking(10).unwrap();
    device.request_wait_nonblocking(20).unwrap();
    assert_eq!(device.collect_wait_response().unwrap(), WaitOutcome::Reached);
    assert_eq!(
        device.collect_wait_response().unwrap(),
        WaitOutcome::Disconnected
    );
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert_eq!(phy.join().unwrap(), vec![10, 20]);
}

#[test]
fn devices_are_torn_down_independently() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);
    let ns = Namespace::resolve(&config, "s2").unwrap();

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s2", "2G4", 2).unwrap();
        assert_eq!(phy.n_devices(), 2);
        assert_eq!(phy.next_request(0).unwrap(), MessageType::Disconnect);
        assert!(!phy.is_connected(0));
        assert!(phy.is_connected(1));
        assert_eq!(phy.next_request(1).unwrap(), MessageType::Wait);
        assert_eq!(phy.read_wait_payload(1).unwrap(), 5);
        phy.respond_wait_end(1).unwrap();
        assert_eq!(phy.next_request(1).unwrap(), MessageType::Terminate);
        assert!(!phy.is_connected(1));
    });

    let second_config = separate(&config);
    let second = thread::spawn(move || {
        let mut device = DeviceConnection::new_with_config(second_config);
        device.connect("s2", "2G4", 1).unwrap();
        device
    });

    let mut first = DeviceConnection::new_with_config(config);
    first.connect("s2", "2G4", 0).unwrap();
    let mut second = second.join().unwrap();
    first.disconnect();
    assert!(!ns.join("2G4.d0.dtp").exists());
    assert!(ns.join("2G4.d1.dtp").exists());

    assert_eq!(second.request_wait_blocking(5).unwrap(), WaitOutcome::Reached);
    second.terminate();
    phy.join().unwrap();
}

#[test]
fn disconnect_before_wait_end() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s1", "2G4", 1).unwrap();
        assert_eq!(phy.next_request(0).unwrap(), MessageType::Wait);
        assert_eq!(phy.read_wait_payload(0).unwrap(), 500);
        phy.disconnect_all();
    });

    let mut device = DeviceConnection::new_with_config(config);
    device.connect("s1", "2G4", 0).unwrap();
    assert_eq!(
        device.request_wait_blocking(500).unwrap(),
        WaitOutcome::Disconnected
    );
    assert!(!device.is_connected());
    phy.join().unwrap();

    // nothing left to talk to
    assert!(device.request_wait_blocking(600).is_err());
}

#[test]
fn vanished_device_reads_as_disconnect() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s1", "2G4", 1).unwrap();
        let msg = phy.next_request(0).unwrap();
        (msg, phy.is_connected(0))
    });

    let mut device = DeviceConnection::new_with_config(config);
    device.connect("s1", "2G4", 0).unwrap();
    // closes the pipes without saying goodbye
    drop(device);

    assert_eq!(phy.join().unwrap(), (MessageType::Disconnect, false));
}

#[test]
fn cancelled_wait_reports_disconnect() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);
    let device_config = separate(&config);
    let cancel = device_config.cancel.clone();

    let device = thread::spawn(move || {
        let mut device = DeviceConnection::new_with_config(device_config);
        device.connect("s1", "2G4", 0).unwrap();
        let outcome = device.request_wait_blocking(100).unwrap();
        (outcome, device.state())
    });

    let mut phy = PhyConnection::new_with_config(separate(&config));
    phy.initialize("s1", "2G4", 1).unwrap();
    assert_eq!(phy.next_request(0).unwrap(), MessageType::Wait);
    assert_eq!(phy.read_wait_payload(0).unwrap(), 100);
    // never answered
    thread::sleep(Duration::from_millis(30));
    cancel.cancel();
    assert_eq!(
        device.join().unwrap(),
        (WaitOutcome::Disconnected, ConnectionState::Disconnected)
    );
    assert_eq!(phy.next_request(0).unwrap(), MessageType::Disconnect);
}

#[test]
fn raw_payloads_travel_both_ways() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s1", "2G4", 1).unwrap();
        assert_eq!(phy.next_request(0).unwrap(), MessageType::Wait);
        assert_eq!(phy.read_wait_payload(0).unwrap(), 7);
        let mut extra = [0; 5];
        phy.read(0, &mut extra).unwrap();
        assert_eq!(&extra, b"extra");
        phy.send_msg(0, MessageType::WaitEnd, &42_u64.to_ne_bytes()).unwrap();
        phy.send_payload(0, b"zz").unwrap();
        // empty payloads are not sent at all
        phy.send_payload(0, &[]).unwrap();
        phy.disconnect_all();
    });

    let mut device = DeviceConnection::new_with_config(config);
    device.connect("s1", "2G4", 0).unwrap();
    device.request_wait_nonblocking(7).unwrap();
    device.send_payload(b"extra").unwrap();

    let mut header = [0; 4];
    device.read(&mut header).unwrap();
    assert_eq!(MessageType::from_bytes(header).unwrap(), MessageType::WaitEnd);
    let mut time = [0; 8];
    device.read(&mut time).unwrap();
    assert_eq!(u64::from_ne_bytes(time), 42);
    let mut zz = [0; 2];
    device.read(&mut zz).unwrap();
    assert_eq!(&zz, b"zz");
    device.read(&mut header).unwrap();
    assert_eq!(
        MessageType::from_bytes(header).unwrap(),
        MessageType::Disconnect
    );
    phy.join().unwrap();

    // the phy is gone, a short read tears the connection down
    let err = device.read(&mut header).unwrap_err();
    assert!(matches!(err, Error::ShortRead { expected: 4, got: 0 }));
    assert_eq!(device.state(), ConnectionState::Disconnected);
    assert!(matches!(device.read(&mut header), Err(Error::NotConnected)));
}

#[test]
fn phy_read_of_vanished_device_frees_it() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(&tmp);

    let phy_config = separate(&config);
    let phy = thread::spawn(move || {
        let mut phy = PhyConnection::new_with_config(phy_config);
        phy.initialize("s1", "2G4", 1).unwrap();
        let mut buf = [0; 8];
        let err = phy.read(0, &mut buf).unwrap_err();
        (err, phy.is_connected(0))
    });

    let mut device = DeviceConnection::new_with_config(config);
    device.connect("s1", "2G4", 0).unwrap();
    device.send_payload(b"abc").unwrap();
    drop(device);

    let (err, connected) = phy.join().unwrap();
    assert!(matches!(err, Error::ShortRead { expected: 8, got: 3 }));
    assert!(!connected);
}
