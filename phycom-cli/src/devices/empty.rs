use anyhow::Result;
use phycom_net::DeviceConnection;

/// Disconnects right away. Useful to fill a device slot of the phy that
/// nothing else is going to use.
pub fn run(device: &mut DeviceConnection) -> Result<()> {
    debug!("disconnecting...");
    device.disconnect();
    Ok(())
}
