//! Android emulator control using `emulator` and `adb`
//!
//! An emulator's pool token is its console port ("5554"); the matching adb
//! serial is `emulator-<port>`. Ports are reused by the OS across emulator
//! processes, so tokens are handed out with [`next_emulator_token`].

use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_core::{BootOptions, Device, DeviceSignal, DeviceType, Platform};

use crate::process::EmulatorProcess;
use crate::tool_availability::{run_quiet, ToolAvailability};

/// First console port handed to an emulator
pub const FIRST_EMULATOR_PORT: u16 = 5554;

/// Last console port handed to an emulator
pub const LAST_EMULATOR_PORT: u16 = 5584;

/// Maximum time to wait for `sys.boot_completed`
const BOOT_TIMEOUT: Duration = Duration::from_secs(180);

const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Extracts the API level from AVD names such as `Pixel_6_API_33` or
/// `Emulator-Api28-Google`
static API_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[_-]API[_-]?(\d+)").expect("Invalid API pattern regex"));

/// An Android Virtual Device (AVD)
#[derive(Debug, Clone, PartialEq)]
pub struct AndroidAvd {
    /// AVD name (used for boot command)
    pub name: String,
    /// API level (e.g., 33 for Android 13)
    pub api_level: Option<u32>,
}

impl AndroidAvd {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let api_level = parse_api_level(&name);
        Self { name, api_level }
    }

    /// Directory record for this AVD under `token`
    pub fn to_device(&self, token: impl Into<String>) -> Device {
        let mut device = Device::new(token, &self.name, Platform::Android, DeviceType::Emulator);
        device.api_level = self.api_level.map(|api| api.to_string());
        device
    }
}

/// A running emulator as reported by `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningEmulator {
    pub serial: String,
    pub port: u16,
}

impl RunningEmulator {
    pub fn token(&self) -> String {
        self.port.to_string()
    }
}

/// adb serial for a console-port token
pub fn serial_for_token(token: &str) -> String {
    format!("emulator-{}", token)
}

/// Lowest free console port not present in `taken`
///
/// Non-numeric tokens in `taken` are ignored.
pub fn next_emulator_token<S: AsRef<str>>(taken: &[S]) -> Option<String> {
    let used: Vec<u16> = taken
        .iter()
        .filter_map(|t| t.as_ref().parse::<u16>().ok())
        .collect();

    (FIRST_EMULATOR_PORT..=LAST_EMULATOR_PORT)
        .step_by(2)
        .find(|port| !used.contains(port))
        .map(|port| port.to_string())
}

/// Parse the API level out of an AVD name
fn parse_api_level(name: &str) -> Option<u32> {
    API_PATTERN
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// List all available Android AVDs
pub async fn list_android_avds(tools: &ToolAvailability) -> Result<Vec<AndroidAvd>> {
    let output = Command::new(tools.emulator_cmd())
        .arg("-list-avds")
        .output()
        .await
        .map_err(|e| Error::backend(format!("Failed to run emulator: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::backend(format!(
            "emulator -list-avds failed: {}",
            stderr.trim()
        )));
    }

    Ok(parse_avd_list(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse the output of `emulator -list-avds`, one AVD name per line
///
/// Newer emulators print `INFO |` diagnostics on stdout; those are skipped.
fn parse_avd_list(output: &str) -> Vec<AndroidAvd> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains('|'))
        .map(AndroidAvd::new)
        .collect()
}

/// Running emulators according to `adb devices`
pub async fn list_running_emulators(tools: &ToolAvailability) -> Result<Vec<RunningEmulator>> {
    let output = Command::new(tools.adb_cmd())
        .arg("devices")
        .output()
        .await
        .map_err(|e| Error::backend(format!("Failed to run adb: {}", e)))?;

    if !output.status.success() {
        return Err(Error::backend("adb devices returned error"));
    }

    Ok(parse_adb_devices(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `adb devices` output
///
/// Format: `emulator-5554\tdevice`. Offline and unauthorized entries are
/// skipped.
fn parse_adb_devices(output: &str) -> Vec<RunningEmulator> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            let state = parts.next()?;
            if state != "device" {
                return None;
            }
            let port = serial.strip_prefix("emulator-")?.parse().ok()?;
            Some(RunningEmulator {
                serial: serial.to_string(),
                port,
            })
        })
        .collect()
}

/// AVD name of a running emulator (`adb emu avd name`)
pub async fn emulator_avd_name(tools: &ToolAvailability, serial: &str) -> Result<String> {
    let output = Command::new(tools.adb_cmd())
        .args(["-s", serial, "emu", "avd", "name"])
        .output()
        .await
        .map_err(|e| Error::backend(format!("Failed to query AVD name: {}", e)))?;

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && *line != "OK")
        .map(str::to_string)
        .ok_or_else(|| Error::protocol(format!("{} reported no AVD name", serial)))
}

/// Launch an AVD on a given console port
pub fn launch_emulator(
    tools: &ToolAvailability,
    device: &Device,
    port: &str,
    options: &BootOptions,
    signal_tx: mpsc::Sender<DeviceSignal>,
) -> Result<EmulatorProcess> {
    let emulator_cmd = tools
        .emulator_path
        .as_deref()
        .ok_or_else(|| Error::tool_not_found("emulator"))?;

    let mut args = vec!["-avd", device.name.as_str(), "-port", port];
    if options.cold_boot {
        args.push("-no-snapshot-load");
    }
    if options.wipe_data {
        args.push("-wipe-data");
    }
    if options.headless {
        args.push("-no-window");
    }

    info!("Launching emulator: {} {}", emulator_cmd, args.join(" "));

    let child = Command::new(emulator_cmd)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| Error::device_start(&device.name, e.to_string()))?;

    let mut launched = device.clone();
    launched.token = port.to_string();
    Ok(EmulatorProcess::watch(child, launched, signal_tx))
}

/// Whether Android reports `sys.boot_completed=1`
pub async fn is_boot_completed(tools: &ToolAvailability, serial: &str) -> bool {
    Command::new(tools.adb_cmd())
        .args(["-s", serial, "shell", "getprop", "sys.boot_completed"])
        .output()
        .await
        .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "1")
        .unwrap_or(false)
}

/// Wait until the emulator finished booting
pub async fn wait_for_boot(tools: &ToolAvailability, serial: &str) -> Result<()> {
    let start = std::time::Instant::now();

    while start.elapsed() < BOOT_TIMEOUT {
        if is_boot_completed(tools, serial).await {
            return Ok(());
        }
        tokio::time::sleep(BOOT_POLL_INTERVAL).await;
    }

    Err(Error::device_start(serial, "emulator boot timed out"))
}

/// Kill an emulator through its console (`adb emu kill`)
pub async fn kill_emulator(tools: &ToolAvailability, serial: &str) -> Result<()> {
    if run_quiet(tools.adb_cmd(), &["-s", serial, "emu", "kill"]).await {
        Ok(())
    } else {
        Err(Error::backend(format!("adb emu kill failed for {}", serial)))
    }
}

/// Reboot the Android system inside a running emulator
pub async fn reboot_emulator(tools: &ToolAvailability, serial: &str) -> Result<()> {
    if run_quiet(tools.adb_cmd(), &["-s", serial, "reboot"]).await {
        Ok(())
    } else {
        Err(Error::backend(format!("adb reboot failed for {}", serial)))
    }
}

/// Watch an emulator the pool did not launch and emit `Killed` once adb
/// stops listing it
pub fn watch_emulator(
    tools: ToolAvailability,
    device: Device,
    signal_tx: mpsc::Sender<DeviceSignal>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let serial = serial_for_token(&device.token);
        loop {
            tokio::time::sleep(WATCH_INTERVAL).await;

            match list_running_emulators(&tools).await {
                Ok(running) if running.iter().any(|e| e.serial == serial) => continue,
                Ok(_) => {
                    info!("Emulator {} ({}) is gone", device.name, serial);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_avd_list() {
        let output = "Pixel_6_API_33\nEmulator-Api28-Google\n\nMy_Custom_AVD\n";
        let avds = parse_avd_list(output);

        assert_eq!(avds.len(), 3);
        assert_eq!(avds[0], AndroidAvd::new("Pixel_6_API_33"));
        assert_eq!(avds[0].api_level, Some(33));
        assert_eq!(avds[1].api_level, Some(28));
        assert_eq!(avds[2].api_level, None);
    }

    #[test]
    fn test_parse_avd_list_skips_diagnostics() {
        let output = "INFO    | Storing crashdata in: /tmp/android\nPixel_6_API_33\n";
        let avds = parse_avd_list(output);
        assert_eq!(avds.len(), 1);
    }

    #[test]
    fn test_parse_adb_devices() {
        let output = "List of devices attached\n\
                      emulator-5554\tdevice\n\
                      emulator-5556\toffline\n\
                      R58M123ABC\tdevice\n\
                      emulator-5558\tdevice\n";
        let running = parse_adb_devices(output);
        assert_eq!(
            running,
            vec![
                RunningEmulator {
                    serial: "emulator-5554".into(),
                    port: 5554
                },
                RunningEmulator {
                    serial: "emulator-5558".into(),
                    port: 5558
                },
            ]
        );
        assert_eq!(running[0].token(), "5554");
    }

    #[test]
    fn test_next_emulator_token() {
        assert_eq!(next_emulator_token::<&str>(&[]), Some("5554".into()));
        assert_eq!(
            next_emulator_token(&["5554", "5556", "Pixel"]),
            Some("5558".into())
        );

        let all: Vec<String> = (FIRST_EMULATOR_PORT..=LAST_EMULATOR_PORT)
            .step_by(2)
            .map(|p| p.to_string())
            .collect();
        assert_eq!(next_emulator_token(&all), None);
    }

    #[test]
    fn test_avd_to_device() {
        let device = AndroidAvd::new("Emulator-Api28-Google").to_device("5556");
        assert_eq!(device.token, "5556");
        assert_eq!(device.api_level.as_deref(), Some("28"));
        assert!(device.is_android_emulator());
        assert_eq!(serial_for_token(&device.token), "emulator-5556");
    }
}
