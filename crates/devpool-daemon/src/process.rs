//! Ownership of emulator child processes
//!
//! The `Child` handle is moved into a dedicated `wait_for_exit` task. The
//! task reports the exit through the handle's signal channel so the pool
//! learns about emulators that die on their own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Notify};

use devpool_core::prelude::*;
use devpool_core::{Device, DeviceSignal};

/// How long `kill()` waits for the wait task to confirm exit
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// A launched emulator process
///
/// Dropping this value leaves the emulator running; only [`kill`] stops it.
///
/// [`kill`]: EmulatorProcess::kill
pub struct EmulatorProcess {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
}

impl EmulatorProcess {
    /// Take ownership of `child` and start watching it
    pub fn watch(child: Child, device: Device, signal_tx: mpsc::Sender<DeviceSignal>) -> Self {
        let pid = child.id();
        let exited = Arc::new(AtomicBool::new(false));
        let exit_notify = Arc::new(Notify::new());
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(Self::wait_for_exit(
            child,
            kill_rx,
            device,
            signal_tx,
            Arc::clone(&exited),
            Arc::clone(&exit_notify),
        ));

        Self {
            pid,
            kill_tx: Some(kill_tx),
            exited,
            exit_notify,
        }
    }

    /// Background task: owns `child`, waits for it to exit, emits `Killed`
    ///
    /// A dropped kill sender is not a kill request; the task keeps waiting
    /// for a natural exit in that case.
    async fn wait_for_exit(
        mut child: Child,
        mut kill_rx: oneshot::Receiver<()>,
        device: Device,
        signal_tx: mpsc::Sender<DeviceSignal>,
        exited: Arc<AtomicBool>,
        exit_notify: Arc<Notify>,
    ) {
        let signal = tokio::select! {
            result = child.wait() => match result {
                Ok(status) if status.success() => {
                    info!("Emulator {} exited", device.name);
                    DeviceSignal::Killed(device.clone())
                }
                Ok(status) => {
                    warn!("Emulator {} exited with status: {:?}", device.name, status);
                    DeviceSignal::Killed(device.clone())
                }
                Err(e) => {
                    error!("Error waiting for emulator {}: {}", device.name, e);
                    DeviceSignal::Error {
                        device: device.clone(),
                        message: e.to_string(),
                    }
                }
            },
            Ok(()) = &mut kill_rx => {
                info!("Kill requested, stopping emulator {}", device.name);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill emulator {}: {}", device.name, e);
                }
                DeviceSignal::Killed(device.clone())
            }
        };

        exited.store(true, Ordering::Release);
        exit_notify.notify_waiters();

        debug!("Emulator {} wait task emitting {}", device.name, signal.kind());
        let _ = signal_tx.send(signal).await;
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    /// Force-kill the process and wait for the wait task to observe the exit
    pub async fn kill(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        let notified = self.exit_notify.notified();
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }

        if self.has_exited() {
            return Ok(());
        }

        match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, notified).await {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::backend(format!(
                "emulator process {:?} did not exit after kill",
                self.pid
            ))),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use devpool_core::{DeviceType, Platform};
    use tokio::process::Command;

    fn device() -> Device {
        Device::new("5554", "Pixel_6_API_33", Platform::Android, DeviceType::Emulator)
    }

    #[tokio::test]
    async fn test_natural_exit_emits_killed() {
        let child = Command::new("true").spawn().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let process = EmulatorProcess::watch(child, device(), tx);

        let signal = rx.recv().await.unwrap();
        assert!(matches!(signal, DeviceSignal::Killed(ref d) if d.token == "5554"));
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_kill_stops_long_running_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let mut process = EmulatorProcess::watch(child, device(), tx);
        assert!(process.pid().is_some());

        process.kill().await.unwrap();
        assert!(process.has_exited());
        assert!(matches!(rx.recv().await, Some(DeviceSignal::Killed(_))));

        // Second kill is a no-op
        process.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_does_not_kill() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id().unwrap();
        let (tx, _rx) = mpsc::channel(4);
        drop(EmulatorProcess::watch(child, device(), tx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(unsafe { libc::kill(pid as libc::pid_t, 0) }, 0);
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}
