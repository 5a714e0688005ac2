use std::time::{Duration, Instant};

use anyhow::Result;
use phycom_net::{DeviceConnection, Error, SimTime, WaitOutcome};

/// Number of wait requests kept in flight.
const QUEUE_DEPTH: u32 = 10;

/// Reports the simulated time every `interval` simulated microseconds,
/// together with the simulation speed.
pub fn run(device: &mut DeviceConnection, interval: SimTime) -> Result<()> {
    let first = Instant::now();
    let mut last = first;
    let mut time = interval;
    let mut reached: SimTime = 0;

    // one more is queued before each collect
    for _ in 0..QUEUE_DEPTH - 1 {
        if !queue_wait(device, time)? {
            break;
        }
        time = advance(time, interval);
    }

    while device.is_connected() {
        if !queue_wait(device, time)? {
            break;
        }
        if device.collect_wait_response()? == WaitOutcome::Disconnected {
            info!("we have been told to disconnect");
            break;
        }
        reached = advance(reached, interval);
        let now = Instant::now();
        info!(
            "@{}us reached (instantaneous speed={:06.2}x, average={:06.2}x)",
            reached,
            speed(interval, now - last),
            speed(reached, now - first)
        );
        time = advance(time, interval);
        last = now;
    }

    info!(
        "@{}us (end) reached (average speed {:.2}x)",
        reached,
        speed(reached, last - first)
    );
    debug!("disconnecting...");
    device.disconnect();
    Ok(())
}

/// Next point in simulated time, stuck at `TIME_NEVER` once reached.
fn advance(time: SimTime, interval: SimTime) -> SimTime {
    time.saturating_add(interval)
}

/// Queues a wait request, false if the phy is gone.
fn queue_wait(device: &mut DeviceConnection, time: SimTime) -> Result<bool> {
    match device.request_wait_nonblocking(time) {
        Ok(()) => Ok(true),
        Err(Error::PeerLost) => {
            info!("we have been told to disconnect");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Simulated microseconds per real microsecond.
fn speed(simulated: SimTime, real: Duration) -> f64 {
    simulated as f64 / real.as_micros().max(1) as f64
}
