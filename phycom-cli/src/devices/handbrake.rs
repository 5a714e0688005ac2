use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use phycom_net::{DeviceConnection, SimTime, WaitOutcome};

/// Keeps the simulation from running faster than `ratio` times real time.
///
/// Every `poke_period` simulated microseconds the device compares how much
/// real time should have passed with how much did, and sleeps off the
/// difference.
pub fn run(device: &mut DeviceConnection, poke_period: SimTime, ratio: f64) -> Result<()> {
    // first wait lets every device do its initialization
    let mut time = poke_period;
    if device.request_wait_blocking(time)? == WaitOutcome::Disconnected {
        info!("we have been told to disconnect");
        return Ok(());
    }

    let mut expected = Instant::now();
    let step = real_time_step(poke_period, ratio);
    loop {
        time = time.saturating_add(poke_period);
        if device.request_wait_blocking(time)? == WaitOutcome::Disconnected {
            info!("we have been told to disconnect");
            break;
        }
        expected += step;
        let now = Instant::now();
        if expected > now {
            thread::sleep(expected - now);
            debug!("@{} stalled until real time caught up", time);
        } else {
            trace!("@{} behind real time by {:?}", time, now - expected);
        }
    }

    debug!("disconnecting...");
    device.disconnect();
    Ok(())
}

/// Real time that should pass for `poke_period` simulated microseconds.
fn real_time_step(poke_period: SimTime, ratio: f64) -> Duration {
    Duration::from_secs_f64(poke_period as f64 / ratio / 1e6)
}
