//! Device record and lifecycle types shared by every crate

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sentinel used for `startedAt` / `busySince` when the timestamp is unset
pub const UNSET_TIMESTAMP: i64 = -1;

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Mobile platform of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(Error::invalid_filter(format!("unknown platform: {}", other))),
        }
    }
}

/// Kind of device behind a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Emulator,
    Simulator,
    #[serde(alias = "device")]
    PhysicalDevice,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Emulator => "emulator",
            DeviceType::Simulator => "simulator",
            DeviceType::PhysicalDevice => "physical-device",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "emulator" => Ok(DeviceType::Emulator),
            "simulator" => Ok(DeviceType::Simulator),
            "physical-device" | "device" => Ok(DeviceType::PhysicalDevice),
            other => Err(Error::invalid_filter(format!(
                "unknown device type: {}",
                other
            ))),
        }
    }
}

/// Pool status of a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Shutdown,
    Booted,
    Busy,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Shutdown => "SHUTDOWN",
            Status::Booted => "BOOTED",
            Status::Busy => "BUSY",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "SHUTDOWN" => Ok(Status::Shutdown),
            "BOOTED" => Ok(Status::Booted),
            "BUSY" => Ok(Status::Busy),
            other => Err(Error::invalid_filter(format!("unknown status: {}", other))),
        }
    }
}

/// A device record as stored in the Device Directory
///
/// `token` is the current identity reported by the backend and may change
/// across reboots; always re-read the record after a boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub token: String,
    pub name: String,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_version: Option<String>,
    pub status: Status,
    #[serde(default = "unset_timestamp")]
    pub started_at: i64,
    #[serde(default = "unset_timestamp")]
    pub busy_since: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_process_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

fn unset_timestamp() -> i64 {
    UNSET_TIMESTAMP
}

impl Device {
    /// A shut-down record with no lease or process metadata
    pub fn new(
        token: impl Into<String>,
        name: impl Into<String>,
        platform: Platform,
        device_type: DeviceType,
    ) -> Self {
        Self {
            token: token.into(),
            name: name.into(),
            platform,
            device_type,
            api_level: None,
            release_version: None,
            status: Status::Shutdown,
            started_at: UNSET_TIMESTAMP,
            busy_since: UNSET_TIMESTAMP,
            info: None,
            parent_process_pid: None,
            pid: None,
            config: None,
        }
    }

    pub fn with_api_level(mut self, api_level: impl Into<String>) -> Self {
        self.api_level = Some(api_level.into());
        self
    }

    pub fn with_release_version(mut self, version: impl Into<String>) -> Self {
        self.release_version = Some(version.into());
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn is_android_emulator(&self) -> bool {
        self.platform == Platform::Android && self.device_type == DeviceType::Emulator
    }

    /// Whether `other` denotes the same directory record
    ///
    /// Records have no surrogate key, so identity is the combination of
    /// name, platform, type and the token the record carried when read.
    pub fn same_identity(&self, other: &Device) -> bool {
        self.token == other.token
            && self.name == other.name
            && self.platform == other.platform
            && self.device_type == other.device_type
    }

    /// Apply a partial update in place
    pub fn apply(&mut self, patch: &DevicePatch) {
        if let Some(ref token) = patch.token {
            self.token = token.clone();
        }
        if let Some(ref name) = patch.name {
            self.name = name.clone();
        }
        if let Some(ref api_level) = patch.api_level {
            self.api_level = api_level.clone();
        }
        if let Some(ref release_version) = patch.release_version {
            self.release_version = release_version.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(started_at) = patch.started_at {
            self.started_at = started_at;
        }
        if let Some(busy_since) = patch.busy_since {
            self.busy_since = busy_since;
        }
        if let Some(ref info) = patch.info {
            self.info = info.clone();
        }
        if let Some(parent_pid) = patch.parent_process_pid {
            self.parent_process_pid = parent_pid;
        }
        if let Some(pid) = patch.pid {
            self.pid = pid;
        }
        if let Some(ref config) = patch.config {
            self.config = config.clone();
        }
    }
}

/// Field-wise partial update of a [`Device`]
///
/// `None` leaves a field untouched. Optional record fields use a nested
/// `Option` so that `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevicePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_level: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_version: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busy_since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_process_pid: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<Option<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Option<serde_json::Value>>,
}

impl DevicePatch {
    /// Patch that marks a record `SHUTDOWN` and drops its lease
    pub fn shutdown() -> Self {
        Self {
            status: Some(Status::Shutdown),
            started_at: Some(UNSET_TIMESTAMP),
            busy_since: Some(UNSET_TIMESTAMP),
            info: Some(None),
            parent_process_pid: Some(None),
            ..Default::default()
        }
    }

    /// Patch that grants a lease
    pub fn lease(info: Option<String>, parent_process_pid: Option<u32>, now: i64) -> Self {
        Self {
            status: Some(Status::Busy),
            busy_since: Some(now),
            info: Some(info),
            parent_process_pid: Some(parent_process_pid),
            ..Default::default()
        }
    }

    /// Patch that returns a leased record to `BOOTED`
    pub fn release() -> Self {
        Self {
            status: Some(Status::Booted),
            busy_since: Some(UNSET_TIMESTAMP),
            info: Some(None),
            parent_process_pid: Some(None),
            ..Default::default()
        }
    }

    /// Patch carrying the backend-reported process state of a running device
    pub fn from_running(device: &Device) -> Self {
        Self {
            token: Some(device.token.clone()),
            status: Some(device.status),
            started_at: Some(device.started_at),
            pid: Some(device.pid),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == DevicePatch::default()
    }
}

/// Flags forwarded to the device backend when starting a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BootOptions {
    /// Skip snapshots and perform a full boot
    pub cold_boot: bool,
    /// Erase user data before booting
    pub wipe_data: bool,
    /// Run without a window
    pub headless: bool,
}

impl BootOptions {
    /// Parse a comma-separated flag list such as `cold-boot,headless`
    pub fn from_flags(flags: &str) -> Result<Self> {
        let mut options = BootOptions::default();
        for flag in flags.split(',').map(str::trim).filter(|f| !f.is_empty()) {
            match flag {
                "cold-boot" | "coldBoot" => options.cold_boot = true,
                "wipe-data" | "wipeData" => options.wipe_data = true,
                "headless" | "no-window" => options.headless = true,
                other => {
                    return Err(Error::invalid_filter(format!(
                        "unknown boot option: {}",
                        other
                    )))
                }
            }
        }
        Ok(options)
    }

    /// Merge two option sets; a flag set on either side stays set
    pub fn union(&self, other: &BootOptions) -> BootOptions {
        BootOptions {
            cold_boot: self.cold_boot || other.cold_boot,
            wipe_data: self.wipe_data || other.wipe_data,
            headless: self.headless || other.headless,
        }
    }
}
