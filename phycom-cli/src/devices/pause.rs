use std::io::{self, BufRead, Write};

use anyhow::Result;
use phycom_net::{DeviceConnection, SimTime, WaitOutcome};

/// Stops the simulation at each of `times` until ENTER is pressed.
pub fn run(device: &mut DeviceConnection, times: &[SimTime]) -> Result<()> {
    check_ordered(times)?;
    let stdin = io::stdin();
    let mut line = String::new();
    for &time in times {
        if device.request_wait_blocking(time)? == WaitOutcome::Disconnected {
            info!("we have been told to disconnect");
            break;
        }
        print!("@{} Press \"ENTER\" to continue...", time);
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            warn!("break in stdin, are you running me in a script without feeding something to it?");
            break;
        }
    }
    debug!("disconnecting...");
    device.disconnect();
    Ok(())
}

/// Pause times have to be non-decreasing.
pub fn check_ordered(times: &[SimTime]) -> Result<()> {
    for (i, pair) in times.windows(2).enumerate() {
        if pair[1] < pair[0] {
            anyhow::bail!(
                "the list of times needs to be ordered (index {}: {} < {})",
                i + 1,
                pair[1],
                pair[0]
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(check_ordered(&[]).is_ok());
        assert!(check_ordered(&[5]).is_ok());
        assert!(check_ordered(&[1, 1, 7]).is_ok());
        let err = check_ordered(&[1, 8, 7]).unwrap_err();
        assert!(err.to_string().contains("index 2"));
    }
}
