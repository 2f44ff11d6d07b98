//! Attached iOS device tracking.
//!
//! The host-side multiplexer is polled once per second through the `tidevice`
//! CLI; snapshots are diffed into add/remove events. Device metadata is
//! fetched once, at attach time, with a short-lived subprocess.

use std::{collections::HashMap, process::Stdio, time::Duration};

use tokio::process::Command;

use crate::{adb::DeviceEvent, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UsbmuxClient {
    poll_interval: Duration,
}

impl Default for UsbmuxClient {
    fn default() -> Self {
        Self { poll_interval: Duration::from_secs(1) }
    }
}

impl UsbmuxClient {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Current set of attached device identifiers. Errors degrade to an empty
    /// list so a missing CLI reads as "no devices".
    pub async fn list_devices(&self) -> Vec<String> {
        match run_command("tidevice", &["list"]).await {
            Ok(output) => output
                .lines()
                .filter_map(|line| line.split_whitespace().next())
                .map(str::to_string)
                .collect(),
            Err(e) => {
                log::warn!("usbmux list failed: {}", e);
                Vec::new()
            }
        }
    }

    /// `Key: Value` property lines of `tidevice info`.
    pub async fn device_info(&self, serial: &str) -> Result<HashMap<String, String>> {
        let output = run_command("tidevice", &["-u", serial, "info"]).await?;
        Ok(parse_info(&output))
    }

    /// Polls forever, emitting removals before additions on every snapshot.
    pub async fn track_devices(&self, mut emit: impl FnMut(DeviceEvent)) -> Result<()> {
        let mut known: Vec<String> = Vec::new();
        loop {
            let current = self.list_devices().await;
            for serial in known.iter().filter(|s| !current.contains(s)) {
                emit(DeviceEvent {
                    present: false,
                    serial: serial.clone(),
                    status: None,
                });
            }
            for serial in current.iter().filter(|s| !known.contains(s)) {
                emit(DeviceEvent {
                    present: true,
                    serial: serial.clone(),
                    status: None,
                });
            }
            known = current;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

fn parse_info(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

async fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::time::timeout(
        COMMAND_TIMEOUT,
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::TimedOut, format!("{program} timed out"))
    })??;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn info_lines_parse_into_pairs() {
        let info = parse_info("DeviceName: my phone\nProductVersion: 16.2\nMarketName: iPhone 12\n");
        assert_eq!(info["DeviceName"], "my phone");
        assert_eq!(info["ProductVersion"], "16.2");
        assert_eq!(info["MarketName"], "iPhone 12");
    }
}
