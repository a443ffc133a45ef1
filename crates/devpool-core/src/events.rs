//! Lifecycle signals emitted by live device handles

use crate::types::Device;

/// Event raised by the backend for one live device
///
/// Handles only ever emit these; they hold no reference to the pool.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceSignal {
    /// The backing process exited or the device left the booted state
    Killed(Device),

    /// The backend observed a failure it could not act on
    Error { device: Device, message: String },

    /// The handle finished attaching to an already-running device
    Attached(Device),
}

impl DeviceSignal {
    pub fn device(&self) -> &Device {
        match self {
            DeviceSignal::Killed(device) => device,
            DeviceSignal::Error { device, .. } => device,
            DeviceSignal::Attached(device) => device,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceSignal::Killed(_) => "killed",
            DeviceSignal::Error { .. } => "error",
            DeviceSignal::Attached(_) => "attached",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceType, Platform};

    #[test]
    fn test_signal_exposes_device() {
        let device = Device::new("ABC", "iPhone 15", Platform::Ios, DeviceType::Simulator);
        let signal = DeviceSignal::Error {
            device: device.clone(),
            message: "boot timed out".into(),
        };
        assert_eq!(signal.device(), &device);
        assert_eq!(signal.kind(), "error");
        assert_eq!(DeviceSignal::Killed(device).kind(), "killed");
    }
}
