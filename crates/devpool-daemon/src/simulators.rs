//! iOS simulator control using `xcrun simctl`
//!
//! Inventory comes from `xcrun simctl list devices -j`; a simulator's UDID is
//! its pool token and the runtime version becomes the record's
//! `releaseVersion`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_core::{now_millis, Device, DeviceSignal, DeviceType, Platform, Status};

/// Maximum time to wait for `simctl boot` to reach `Booted`
const BOOT_TIMEOUT: Duration = Duration::from_secs(120);

/// Interval between state checks while booting or watching
const STATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between state checks of a watched simulator
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// An iOS simulator known to simctl
#[derive(Debug, Clone, PartialEq)]
pub struct IosSimulator {
    pub udid: String,
    pub name: String,
    /// Friendly runtime, e.g. "iOS 17.2"
    pub runtime: String,
    pub state: SimulatorState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatorState {
    Shutdown,
    Booted,
    Booting,
    ShuttingDown,
    Unknown,
}

impl From<&str> for SimulatorState {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "shutdown" => SimulatorState::Shutdown,
            "booted" => SimulatorState::Booted,
            "booting" => SimulatorState::Booting,
            "shutting down" => SimulatorState::ShuttingDown,
            _ => SimulatorState::Unknown,
        }
    }
}

impl IosSimulator {
    /// Version part of the runtime ("iOS 17.2" -> "17.2")
    pub fn release_version(&self) -> Option<&str> {
        self.runtime.split_once(' ').map(|(_, version)| version)
    }

    /// Directory record for this simulator
    pub fn to_device(&self) -> Device {
        let mut device = Device::new(&self.udid, &self.name, Platform::Ios, DeviceType::Simulator);
        device.release_version = self.release_version().map(str::to_string);
        if self.state == SimulatorState::Booted {
            device.status = Status::Booted;
            device.started_at = now_millis();
        }
        device
    }
}

/// JSON output from `xcrun simctl list devices -j`
#[derive(Debug, Deserialize)]
struct SimctlOutput {
    devices: HashMap<String, Vec<SimctlDevice>>,
}

#[derive(Debug, Deserialize)]
struct SimctlDevice {
    udid: String,
    name: String,
    state: String,
    #[serde(rename = "isAvailable")]
    is_available: Option<bool>,
}

/// List all available iOS simulators
pub async fn list_ios_simulators() -> Result<Vec<IosSimulator>> {
    let output = Command::new("xcrun")
        .args(["simctl", "list", "devices", "-j"])
        .output()
        .await
        .map_err(|e| Error::backend(format!("Failed to run xcrun simctl: {}", e)))?;

    if !output.status.success() {
        return Err(Error::backend("xcrun simctl list returned error"));
    }

    parse_simctl_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `simctl list devices -j`, keeping available iOS simulators only
pub fn parse_simctl_output(json: &str) -> Result<Vec<IosSimulator>> {
    let parsed: SimctlOutput = serde_json::from_str(json)
        .map_err(|e| Error::protocol(format!("Failed to parse simctl output: {}", e)))?;

    let mut simulators = Vec::new();

    for (runtime_key, devices) in parsed.devices {
        let runtime = parse_runtime_name(&runtime_key);
        if !runtime.starts_with("iOS") {
            continue;
        }

        for device in devices {
            if device.is_available == Some(false) {
                continue;
            }

            simulators.push(IosSimulator {
                udid: device.udid,
                name: device.name,
                runtime: runtime.clone(),
                state: SimulatorState::from(device.state.as_str()),
            });
        }
    }

    // Newest runtime first, then by name
    simulators.sort_by(|a, b| b.runtime.cmp(&a.runtime).then_with(|| a.name.cmp(&b.name)));

    Ok(simulators)
}

/// Parse runtime identifier to friendly name
/// "com.apple.CoreSimulator.SimRuntime.iOS-17-2" -> "iOS 17.2"
fn parse_runtime_name(identifier: &str) -> String {
    if let Some(suffix) = identifier.strip_prefix("com.apple.CoreSimulator.SimRuntime.") {
        if let Some((os_name, version)) = suffix.split_once('-') {
            format!("{} {}", os_name, version.replace('-', "."))
        } else {
            suffix.to_string()
        }
    } else {
        identifier.to_string()
    }
}

/// Current state of one simulator, `None` if simctl no longer lists it
pub async fn simulator_state(udid: &str) -> Result<Option<SimulatorState>> {
    let simulators = list_ios_simulators().await?;
    Ok(simulators.into_iter().find(|s| s.udid == udid).map(|s| s.state))
}

/// Boot an iOS simulator by UDID and wait until it reports `Booted`
pub async fn boot_simulator(udid: &str) -> Result<()> {
    if simulator_state(udid).await? == Some(SimulatorState::Booted) {
        return Ok(());
    }

    let output = Command::new("xcrun")
        .args(["simctl", "boot", udid])
        .output()
        .await
        .map_err(|e| Error::backend(format!("Failed to boot simulator: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "Unable to boot device in current state: Booted" is not an error
        if !stderr.contains("Booted") {
            return Err(Error::device_start(udid, stderr.trim()));
        }
    }

    wait_for_simulator_boot(udid, BOOT_TIMEOUT).await
}

async fn wait_for_simulator_boot(udid: &str, max_wait: Duration) -> Result<()> {
    let start = std::time::Instant::now();

    while start.elapsed() < max_wait {
        if simulator_state(udid).await? == Some(SimulatorState::Booted) {
            return Ok(());
        }
        tokio::time::sleep(STATE_POLL_INTERVAL).await;
    }

    Err(Error::device_start(udid, "simulator boot timed out"))
}

/// Shutdown an iOS simulator
pub async fn shutdown_simulator(udid: &str) -> Result<()> {
    let output = Command::new("xcrun")
        .args(["simctl", "shutdown", udid])
        .output()
        .await
        .map_err(|e| Error::backend(format!("Failed to shutdown simulator: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Ignore "Unable to shutdown device in current state: Shutdown"
        if !stderr.contains("Shutdown") {
            return Err(Error::backend(format!(
                "Failed to shutdown simulator: {}",
                stderr.trim()
            )));
        }
    }

    Ok(())
}

/// Watch a booted simulator and emit `Killed` once it stops running
pub fn watch_simulator(device: Device, signal_tx: mpsc::Sender<DeviceSignal>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(WATCH_INTERVAL).await;

            match simulator_state(&device.token).await {
                Ok(Some(SimulatorState::Booted | SimulatorState::Booting)) => continue,
                Ok(_) => {
                    info!("Simulator {} ({}) is no longer booted", device.name, device.token);
                    let _ = signal_tx.send(DeviceSignal::Killed(device.clone())).await;
                    break;
                }
                Err(e) => {
                    let signal = DeviceSignal::Error {
                        device: device.clone(),
                        message: e.to_string(),
                    };
                    if signal_tx.send(signal).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}
