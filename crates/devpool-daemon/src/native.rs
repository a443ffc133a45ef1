//! Device backend over the local iOS and Android tooling

use tokio::sync::mpsc;

use devpool_core::prelude::*;
use devpool_core::{
    now_millis, BootOptions, Device, DeviceFilter, DeviceSignal, DeviceType, Platform, Status,
};

use crate::avds::{self, AndroidAvd};
use crate::backend::{DeviceBackend, LiveHandle, SIGNAL_CHANNEL_CAPACITY};
use crate::simulators;
use crate::tool_availability::ToolAvailability;

/// Backend that drives `xcrun simctl`, `emulator` and `adb`
#[derive(Debug, Clone)]
pub struct NativeBackend {
    tools: ToolAvailability,
}

impl NativeBackend {
    pub fn new(tools: ToolAvailability) -> Self {
        Self { tools }
    }

    /// Detect the available tools and build a backend over them
    pub async fn detect() -> Self {
        let tools = ToolAvailability::check().await;
        if let Some(message) = tools.ios_unavailable_message() {
            info!("{}", message);
        }
        if let Some(message) = tools.android_unavailable_message() {
            info!("{}", message);
        }
        Self::new(tools)
    }

    pub fn tools(&self) -> &ToolAvailability {
        &self.tools
    }

    async fn ios_inventory(&self) -> Result<Vec<Device>> {
        if !self.tools.xcrun_simctl {
            return Ok(Vec::new());
        }
        let simulators = simulators::list_ios_simulators().await?;
        Ok(simulators.iter().map(|s| s.to_device()).collect())
    }

    /// Emulators adb currently lists, as booted records
    async fn running_android(&self) -> Result<Vec<Device>> {
        if !self.tools.adb() {
            return Ok(Vec::new());
        }

        let mut devices = Vec::new();
        for emulator in avds::list_running_emulators(&self.tools).await? {
            match avds::emulator_avd_name(&self.tools, &emulator.serial).await {
                Ok(name) => {
                    let mut device = AndroidAvd::new(name).to_device(emulator.token());
                    device.status = Status::Booted;
                    device.started_at = now_millis();
                    devices.push(device);
                }
                Err(e) => warn!("Skipping {}: {}", emulator.serial, e),
            }
        }
        Ok(devices)
    }

    /// Every AVD, running ones under their console port, the rest under
    /// the lowest free ports
    async fn android_inventory(&self) -> Result<Vec<Device>> {
        if !self.tools.android_emulator() {
            return Ok(Vec::new());
        }

        let running = self.running_android().await?;
        let mut taken: Vec<String> = running.iter().map(|d| d.token.clone()).collect();
        let mut devices = Vec::new();

        for avd in avds::list_android_avds(&self.tools).await? {
            if let Some(live) = running.iter().find(|d| d.name == avd.name) {
                devices.push(live.clone());
                continue;
            }

            let token = match avds::next_emulator_token(&taken) {
                Some(token) => token,
                None => avd.name.clone(),
            };
            taken.push(token.clone());
            devices.push(avd.to_device(token));
        }

        Ok(devices)
    }

    async fn start_simulator(&self, device: &Device) -> Result<LiveHandle> {
        simulators::boot_simulator(&device.token).await?;

        let mut booted = device.clone();
        booted.status = Status::Booted;
        booted.started_at = now_millis();

        let (handle, tx) = LiveHandle::channel(booted.clone());
        Ok(handle.with_watcher(simulators::watch_simulator(booted, tx)))
    }

    async fn start_emulator(&self, device: &Device, options: &BootOptions) -> Result<LiveHandle> {
        let running: Vec<String> = avds::list_running_emulators(&self.tools)
            .await
            .unwrap_or_default()
            .iter()
            .map(|e| e.token())
            .collect();

        let port = match device.token.parse::<u16>() {
            Ok(_) if !running.contains(&device.token) => device.token.clone(),
            _ => avds::next_emulator_token(&running)
                .ok_or_else(|| Error::device_start(&device.name, "no free emulator port"))?,
        };
        if port != device.token {
            debug!("Emulator {} moves from token {} to {}", device.name, device.token, port);
        }

        let mut booted = device.clone();
        booted.token = port.clone();

        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        let mut process = avds::launch_emulator(&self.tools, &booted, &port, options, tx)?;

        let serial = avds::serial_for_token(&port);
        if let Err(e) = avds::wait_for_boot(&self.tools, &serial).await {
            let _ = process.kill().await;
            return Err(e);
        }

        booted.status = Status::Booted;
        booted.started_at = now_millis();
        booted.pid = process.pid();

        Ok(LiveHandle::new(booted, rx).with_process(process))
    }
}

impl DeviceBackend for NativeBackend {
    async fn start_device(&self, device: &Device, options: &BootOptions) -> Result<LiveHandle> {
        info!("Starting {} {} ({})", device.platform, device.name, device.token);
        match (device.platform, device.device_type) {
            (Platform::Ios, DeviceType::Simulator) => self.start_simulator(device).await,
            (Platform::Android, DeviceType::Emulator) => {
                self.start_emulator(device, options).await
            }
            (_, DeviceType::PhysicalDevice) => Err(Error::device_start(
                &device.name,
                "physical devices cannot be started by the pool",
            )),
            (platform, device_type) => Err(Error::device_start(
                &device.name,
                format!("unsupported {} {}", platform, device_type),
            )),
        }
    }

    async fn attach_to_running_device(&self, device: &Device) -> Result<LiveHandle> {
        let mut attached = device.clone();
        attached.status = Status::Booted;
        if attached.started_at < 0 {
            attached.started_at = now_millis();
        }

        let (handle, tx) = LiveHandle::channel(attached.clone());
        let _ = tx.try_send(DeviceSignal::Attached(attached.clone()));

        let watcher = match device.platform {
            Platform::Ios => simulators::watch_simulator(attached, tx),
            Platform::Android => avds::watch_emulator(self.tools.clone(), attached, tx),
        };
        Ok(handle.with_watcher(watcher))
    }

    async fn stop_device(&self, handle: &mut LiveHandle) -> Result<()> {
        handle.detach();

        if let Some(process) = handle.process_mut() {
            return process.kill().await;
        }

        let device = handle.device().clone();
        self.kill_by_identity(&device).await
    }

    async fn kill_by_identity(&self, device: &Device) -> Result<()> {
        if device.device_type == DeviceType::PhysicalDevice {
            debug!("Not killing physical device {}", device.name);
            return Ok(());
        }

        match device.platform {
            Platform::Ios => simulators::shutdown_simulator(&device.token).await,
            Platform::Android => {
                let running = self.running_android().await?;
                let target = running
                    .iter()
                    .find(|d| d.token == device.token && d.name == device.name)
                    .or_else(|| running.iter().find(|d| d.name == device.name));

                match target {
                    Some(live) => {
                        avds::kill_emulator(&self.tools, &avds::serial_for_token(&live.token))
                            .await
                    }
                    None => {
                        debug!("Emulator {} is not running, nothing to kill", device.name);
                        Ok(())
                    }
                }
            }
        }
    }

    async fn inventory(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let mut devices = Vec::new();
        if filter.platform.is_none_or(|p| p == Platform::Ios) {
            devices.extend(self.ios_inventory().await?);
        }
        if filter.platform.is_none_or(|p| p == Platform::Android) {
            devices.extend(self.android_inventory().await?);
        }
        devices.retain(|d| filter.matches(d));
        Ok(devices)
    }

    async fn running_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .ios_inventory()
            .await?
            .into_iter()
            .filter(|d| d.status == Status::Booted)
            .collect();
        devices.extend(self.running_android().await?);
        Ok(devices)
    }

    async fn is_emulator_responsive(&self, device: &Device) -> bool {
        avds::is_boot_completed(&self.tools, &avds::serial_for_token(&device.token)).await
    }

    async fn reboot_emulator(&self, device: &Device) -> Result<()> {
        info!("Rebooting unresponsive emulator {} ({})", device.name, device.token);
        avds::reboot_emulator(&self.tools, &avds::serial_for_token(&device.token)).await
    }
}
