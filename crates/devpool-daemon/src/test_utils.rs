//! Test doubles for the backend and liveness probe
//!
//! [`FakeBackend`] keeps an in-memory model of which devices are running,
//! hands out live handles whose signals tests can fire, and counts every
//! call the engine makes. [`FakeProbe`] answers liveness from a pid set.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::mpsc;

use devpool_core::prelude::*;
use devpool_core::{
    now_millis, BootOptions, Device, DeviceFilter, DeviceSignal, DeviceType, Platform, Status,
};

use crate::backend::{DeviceBackend, LiveHandle};
use crate::liveness::ProcessProbe;

/// Creates a shut-down Android emulator record
pub fn android_emulator(token: &str, name: &str, api_level: &str) -> Device {
    Device::new(token, name, Platform::Android, DeviceType::Emulator).with_api_level(api_level)
}

/// Creates a shut-down iOS simulator record
pub fn ios_simulator(token: &str, name: &str, release_version: &str) -> Device {
    Device::new(token, name, Platform::Ios, DeviceType::Simulator)
        .with_release_version(release_version)
}

#[derive(Default)]
struct FakeState {
    /// Every device the fake knows, keyed by name
    known: Vec<Device>,
    /// Running devices by token
    running: HashMap<String, Device>,
    /// Signal senders of handed-out handles, by token
    senders: HashMap<String, mpsc::Sender<DeviceSignal>>,
    /// Tokens to assign on the next start of a device name
    token_overrides: HashMap<String, String>,
    failing: HashSet<String>,
    unresponsive: HashSet<String>,
    starts: Vec<String>,
    stops: Vec<String>,
    identity_kills: Vec<String>,
    reboots: Vec<String>,
    attaches: Vec<String>,
}

/// In-memory device backend
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend knowing `devices`; those with a non-shutdown status run
    pub fn with_devices(devices: Vec<Device>) -> Self {
        let backend = Self::new();
        {
            let mut state = backend.lock();
            for device in &devices {
                if device.status != Status::Shutdown {
                    state.running.insert(device.token.clone(), device.clone());
                }
            }
            state.known = devices;
        }
        backend
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next start of `name` report `token`
    pub fn reassign_token_on_start(&self, name: &str, token: &str) {
        self.lock()
            .token_overrides
            .insert(name.to_string(), token.to_string());
    }

    /// Make every start of `name` fail
    pub fn fail_start(&self, name: &str) {
        self.lock().failing.insert(name.to_string());
    }

    pub fn set_unresponsive(&self, token: &str) {
        self.lock().unresponsive.insert(token.to_string());
    }

    /// Simulate a device started outside the pool
    pub fn start_externally(&self, device: Device) {
        let mut device = device;
        device.status = Status::Booted;
        device.started_at = now_millis();
        self.lock().running.insert(device.token.clone(), device);
    }

    /// Simulate the device dying on its own; fires `Killed` on its handle
    pub async fn kill_externally(&self, token: &str) -> bool {
        let (device, sender) = {
            let mut state = self.lock();
            let device = state.running.remove(token);
            let sender = state.senders.remove(token);
            (device, sender)
        };

        match (device, sender) {
            (Some(device), Some(sender)) => {
                sender.send(DeviceSignal::Killed(device)).await.is_ok()
            }
            _ => false,
        }
    }

    /// Fire an arbitrary signal on the handle registered for `token`
    pub async fn emit(&self, token: &str, signal: DeviceSignal) -> bool {
        let sender = self.lock().senders.get(token).cloned();
        match sender {
            Some(sender) => sender.send(signal).await.is_ok(),
            None => false,
        }
    }

    pub fn is_running(&self, token: &str) -> bool {
        self.lock().running.contains_key(token)
    }

    pub fn running_tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.lock().running.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    /// Names passed to `start_device`, in call order
    pub fn starts(&self) -> Vec<String> {
        self.lock().starts.clone()
    }

    pub fn start_count(&self) -> usize {
        self.lock().starts.len()
    }

    /// Tokens passed to `stop_device`, in call order
    pub fn stops(&self) -> Vec<String> {
        self.lock().stops.clone()
    }

    pub fn identity_kills(&self) -> Vec<String> {
        self.lock().identity_kills.clone()
    }

    pub fn reboots(&self) -> Vec<String> {
        self.lock().reboots.clone()
    }

    pub fn attaches(&self) -> Vec<String> {
        self.lock().attaches.clone()
    }

    fn handle_for(&self, device: Device) -> LiveHandle {
        let (handle, tx) = LiveHandle::channel(device.clone());
        self.lock().senders.insert(device.token, tx);
        handle
    }
}

impl DeviceBackend for FakeBackend {
    async fn start_device(&self, device: &Device, _options: &BootOptions) -> Result<LiveHandle> {
        let booted = {
            let mut state = self.lock();
            state.starts.push(device.name.clone());

            if state.failing.contains(&device.name) {
                return Err(Error::device_start(&device.name, "fake start failure"));
            }

            let mut booted = device.clone();
            if let Some(token) = state.token_overrides.remove(&device.name) {
                booted.token = token;
            }
            booted.status = Status::Booted;
            booted.started_at = now_millis();
            booted.busy_since = devpool_core::UNSET_TIMESTAMP;
            state.running.insert(booted.token.clone(), booted.clone());
            if let Some(known) = state.known.iter_mut().find(|d| d.name == device.name) {
                *known = booted.clone();
            }
            booted
        };

        Ok(self.handle_for(booted))
    }

    async fn attach_to_running_device(&self, device: &Device) -> Result<LiveHandle> {
        self.lock().attaches.push(device.token.clone());

        let mut attached = device.clone();
        attached.status = Status::Booted;
        let handle = self.handle_for(attached.clone());
        self.emit(&attached.token, DeviceSignal::Attached(attached.clone()))
            .await;
        Ok(handle)
    }

    async fn stop_device(&self, handle: &mut LiveHandle) -> Result<()> {
        handle.detach();
        let mut state = self.lock();
        state.stops.push(handle.token().to_string());
        state.running.remove(handle.token());
        state.senders.remove(handle.token());
        Ok(())
    }

    async fn kill_by_identity(&self, device: &Device) -> Result<()> {
        let mut state = self.lock();
        state.identity_kills.push(device.token.clone());
        state.running.remove(&device.token);
        state.senders.remove(&device.token);
        Ok(())
    }

    async fn inventory(&self, filter: &DeviceFilter) -> Result<Vec<Device>> {
        let state = self.lock();
        let mut devices: Vec<Device> = state
            .known
            .iter()
            .map(|known| {
                state
                    .running
                    .values()
                    .find(|r| r.name == known.name)
                    .cloned()
                    .unwrap_or_else(|| {
                        let mut stopped = known.clone();
                        stopped.apply(&devpool_core::DevicePatch::shutdown());
                        stopped.pid = None;
                        stopped
                    })
            })
            .collect();

        for running in state.running.values() {
            if !state.known.iter().any(|k| k.name == running.name) {
                devices.push(running.clone());
            }
        }

        devices.retain(|d| filter.matches(d));
        Ok(devices)
    }

    async fn running_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self.lock().running.values().cloned().collect();
        devices.sort_by(|a, b| a.token.cmp(&b.token));
        Ok(devices)
    }

    async fn is_emulator_responsive(&self, device: &Device) -> bool {
        !self.lock().unresponsive.contains(&device.token)
    }

    async fn reboot_emulator(&self, device: &Device) -> Result<()> {
        self.lock().reboots.push(device.token.clone());
        Ok(())
    }
}

/// Liveness probe answering from a fixed pid set
#[derive(Debug, Default)]
pub struct FakeProbe {
    alive: Mutex<HashSet<u32>>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_alive(pids: &[u32]) -> Self {
        let probe = Self::new();
        for pid in pids {
            probe.spawn(*pid);
        }
        probe
    }

    pub fn spawn(&self, pid: u32) {
        self.alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(pid);
    }

    pub fn terminate(&self, pid: u32) {
        self.alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&pid);
    }
}

impl ProcessProbe for FakeProbe {
    fn is_process_alive(&self, pid: u32) -> bool {
        self.alive
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&pid)
    }
}
