//! Tool availability checking for the native backend
//!
//! The native backend shells out to `xcrun simctl` (iOS), `emulator` and
//! `adb` (Android). This module locates them once at startup so each call
//! site does not have to.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;

/// Cached availability of external device tools
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Whether `xcrun simctl` is available (macOS with Xcode)
    pub xcrun_simctl: bool,

    /// Path to the Android `emulator` binary if found
    pub emulator_path: Option<String>,

    /// Path to `adb` if found
    pub adb_path: Option<String>,
}

impl ToolAvailability {
    /// Check tool availability (run once at startup)
    pub async fn check() -> Self {
        let xcrun_simctl = Self::check_xcrun_simctl().await;
        let emulator_path = Self::find_tool("emulator", &Self::sdk_candidates("emulator/emulator"));
        let adb_path = Self::find_tool("adb", &Self::sdk_candidates("platform-tools/adb"));

        tracing::debug!(
            "Tool availability: simctl={} emulator={:?} adb={:?}",
            xcrun_simctl,
            emulator_path,
            adb_path
        );

        Self {
            xcrun_simctl,
            emulator_path,
            adb_path,
        }
    }

    pub fn android_emulator(&self) -> bool {
        self.emulator_path.is_some()
    }

    pub fn adb(&self) -> bool {
        self.adb_path.is_some()
    }

    /// `adb` command, falling back to PATH lookup at spawn time
    pub fn adb_cmd(&self) -> &str {
        self.adb_path.as_deref().unwrap_or("adb")
    }

    /// `emulator` command, falling back to PATH lookup at spawn time
    pub fn emulator_cmd(&self) -> &str {
        self.emulator_path.as_deref().unwrap_or("emulator")
    }

    async fn check_xcrun_simctl() -> bool {
        #[cfg(not(target_os = "macos"))]
        return false;

        #[cfg(target_os = "macos")]
        {
            Command::new("xcrun")
                .args(["simctl", "help"])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map(|s| s.success())
                .inspect_err(|e| tracing::debug!("xcrun simctl check failed: {}", e))
                .unwrap_or(false)
        }
    }

    /// Resolve a tool from PATH first, then from SDK locations
    fn find_tool(name: &str, sdk_candidates: &[PathBuf]) -> Option<String> {
        if let Ok(path) = which::which(name) {
            return Some(path.to_string_lossy().into_owned());
        }

        sdk_candidates
            .iter()
            .find(|p| p.is_file())
            .map(|p| p.to_string_lossy().into_owned())
    }

    /// Candidate paths below `ANDROID_HOME` and `ANDROID_SDK_ROOT`
    fn sdk_candidates(relative: &str) -> Vec<PathBuf> {
        ["ANDROID_HOME", "ANDROID_SDK_ROOT"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|root| PathBuf::from(root).join(relative))
            .collect()
    }

    /// Get user-friendly message for unavailable iOS tools
    pub fn ios_unavailable_message(&self) -> Option<&'static str> {
        if self.xcrun_simctl {
            None
        } else {
            #[cfg(target_os = "macos")]
            {
                Some("Xcode not installed. Install Xcode to manage iOS simulators.")
            }

            #[cfg(not(target_os = "macos"))]
            {
                Some("iOS simulators are only available on macOS.")
            }
        }
    }

    /// Get user-friendly message for unavailable Android tools
    pub fn android_unavailable_message(&self) -> Option<&'static str> {
        if self.android_emulator() && self.adb() {
            None
        } else {
            Some("Android SDK not found. Set ANDROID_HOME or install Android Studio.")
        }
    }
}

/// Run a tool to completion with stdio discarded, reporting success
pub(crate) async fn run_quiet(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
