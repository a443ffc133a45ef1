//! # devpool-daemon - Device-facing side of the pool
//!
//! Everything the pool engine consumes from the outside world: the device
//! directory, the device backend and the process liveness probe, plus the
//! native implementations of each.
//!
//! Depends on [`devpool_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Contracts
//! - [`DeviceDirectory`] - Stored device records (find / update / insert / delete)
//! - [`DeviceBackend`] - Start, attach, stop and enumerate devices
//! - [`LiveHandle`] - A running device plus its signal stream
//! - [`ProcessProbe`] - Point-in-time pid liveness
//!
//! ### Implementations
//! - [`MemoryDirectory`] - In-memory directory with optional JSON snapshot
//! - [`NativeBackend`] - `xcrun simctl` / `emulator` / `adb` backend
//! - [`SystemProbe`] - OS-backed liveness probe
//!
//! ### Platform Utilities
//! - [`IosSimulator`], [`AndroidAvd`] - Platform-specific device listings
//! - [`next_emulator_token()`] - Lowest free Android console port
//! - [`ToolAvailability`] - Check for Android SDK, iOS tools

pub mod avds;
pub mod backend;
pub mod directory;
pub mod liveness;
pub mod native;
pub mod process;
pub mod simulators;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tool_availability;

pub use avds::{next_emulator_token, AndroidAvd, RunningEmulator};
pub use backend::{DeviceBackend, LiveHandle, LocalDeviceBackend};
pub use directory::{DeviceDirectory, LocalDeviceDirectory, MemoryDirectory};
pub use liveness::{ProcessProbe, SystemProbe};
pub use native::NativeBackend;
pub use process::EmulatorProcess;
pub use simulators::{IosSimulator, SimulatorState};
pub use tool_availability::ToolAvailability;
