//! Device backend contract and live handles
//!
//! A backend starts, attaches to, stops and enumerates devices. Every
//! running device the pool tracks is represented by a [`LiveHandle`]; the
//! handle owns whatever keeps the device observable (an emulator child
//! process, a state watcher) and exposes the lifecycle signals as a channel.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use devpool_core::prelude::*;
use devpool_core::{BootOptions, Device, DeviceFilter, DeviceSignal};

use crate::process::EmulatorProcess;

/// Capacity of a handle's signal channel
pub const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// In-memory wrapper around one running device
///
/// Handles never reference the pool. They only emit [`DeviceSignal`]s on
/// the receiver returned by [`LiveHandle::take_signals`].
pub struct LiveHandle {
    device: Device,
    signals: Option<mpsc::Receiver<DeviceSignal>>,
    process: Option<EmulatorProcess>,
    watcher: Option<JoinHandle<()>>,
}

impl LiveHandle {
    /// Create a handle reporting `device` with the given signal stream
    pub fn new(device: Device, signals: mpsc::Receiver<DeviceSignal>) -> Self {
        Self {
            device,
            signals: Some(signals),
            process: None,
            watcher: None,
        }
    }

    /// Create a handle plus the sender its signals are emitted on
    pub fn channel(device: Device) -> (Self, mpsc::Sender<DeviceSignal>) {
        let (tx, rx) = mpsc::channel(SIGNAL_CHANNEL_CAPACITY);
        (Self::new(device, rx), tx)
    }

    pub fn with_process(mut self, process: EmulatorProcess) -> Self {
        self.process = Some(process);
        self
    }

    pub fn with_watcher(mut self, watcher: JoinHandle<()>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Backend-reported state of the device (token, pid, status, startedAt)
    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn token(&self) -> &str {
        &self.device.token
    }

    /// Take the signal stream; only the first caller receives it
    pub fn take_signals(&mut self) -> Option<mpsc::Receiver<DeviceSignal>> {
        self.signals.take()
    }

    pub fn process_mut(&mut self) -> Option<&mut EmulatorProcess> {
        self.process.as_mut()
    }

    /// Stop observing the device without touching the device itself
    pub fn detach(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.signals = None;
    }
}

impl Drop for LiveHandle {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("token", &self.device.token)
            .field("name", &self.device.name)
            .field("has_process", &self.process.is_some())
            .field("has_watcher", &self.watcher.is_some())
            .finish()
    }
}

/// Device-control backend consumed by the pool engine
#[trait_variant::make(DeviceBackend: Send)]
pub trait LocalDeviceBackend {
    /// Start a device of the record's platform/type and return its handle
    ///
    /// The handle's device carries the token the backend actually assigned,
    /// which may differ from `device.token`.
    async fn start_device(&self, device: &Device, options: &BootOptions) -> Result<LiveHandle>;

    /// Wrap an already-running device in a fresh handle
    async fn attach_to_running_device(&self, device: &Device) -> Result<LiveHandle>;

    /// Stop the process behind `handle`
    async fn stop_device(&self, handle: &mut LiveHandle) -> Result<()>;

    /// Best-effort kill of a device the pool holds no handle for
    async fn kill_by_identity(&self, device: &Device) -> Result<()>;

    /// Authoritative inventory of every device matching `filter`, with status
    async fn inventory(&self, filter: &DeviceFilter) -> Result<Vec<Device>>;

    /// Devices currently running, whether or not the pool started them
    async fn running_devices(&self) -> Result<Vec<Device>>;

    async fn is_emulator_responsive(&self, device: &Device) -> bool;

    async fn reboot_emulator(&self, device: &Device) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use devpool_core::{DeviceType, Platform};

    fn sim() -> Device {
        Device::new("ABC", "iPhone 15", Platform::Ios, DeviceType::Simulator)
    }

    #[tokio::test]
    async fn test_signals_are_taken_once() {
        let (mut handle, tx) = LiveHandle::channel(sim());
        let mut rx = handle.take_signals().unwrap();
        assert!(handle.take_signals().is_none());

        tx.send(DeviceSignal::Attached(sim())).await.unwrap();
        assert!(matches!(rx.recv().await, Some(DeviceSignal::Attached(_))));
    }

    #[tokio::test]
    async fn test_detach_aborts_watcher() {
        let watcher = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let (handle, _tx) = LiveHandle::channel(sim());
        let mut handle = handle.with_watcher(watcher);

        handle.detach();
        assert!(handle.take_signals().is_none());
        assert_eq!(handle.token(), "ABC");
    }
}
