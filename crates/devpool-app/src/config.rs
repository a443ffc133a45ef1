//! Pool configuration
//!
//! Sources, lowest to highest precedence:
//! - built-in defaults
//! - `.devpool/config.toml`
//! - environment variables (`MAX_SIMULATORS_COUNT`, `MAX_EMU_COUNT`, ...)
//!
//! The resulting [`PoolConfig`] is built once at startup and handed to the
//! engine by value.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use devpool_core::prelude::*;
use devpool_core::{BootOptions, Platform};

/// Directory holding devpool files inside a project
pub const DEVPOOL_DIR: &str = ".devpool";

/// Config file name inside [`DEVPOOL_DIR`]
pub const CONFIG_FILENAME: &str = "config.toml";

/// Snapshot file name inside [`DEVPOOL_DIR`]
pub const SNAPSHOT_FILENAME: &str = "devices.json";

/// Environment variables per setting; the first name present wins
const ENV_MAX_SIMULATORS: &[&str] = &["MAX_SIMULATORS_COUNT", "MAX_SIM_COUNT"];
const ENV_MAX_EMULATORS: &[&str] = &["MAX_EMULATORS_COUNT", "MAX_EMU_COUNT"];
const ENV_SIM_USAGE_LIMIT: &[&str] = &["SIMULATOR_MAX_USAGE_LIMIT", "SIM_USAGE_LIMIT"];
const ENV_EMU_USAGE_LIMIT: &[&str] = &["EMULATOR_MAX_USAGE_LIMIT", "EMU_USAGE_LIMIT"];
const ENV_POLL_INTERVAL: &[&str] = &["DEVPOOL_POLL_INTERVAL_MS"];

/// Limits and defaults of the device pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Ceiling of booted + busy iOS simulators
    pub max_simulators_count: usize,

    /// Ceiling of booted + busy Android emulators
    pub max_emulators_count: usize,

    /// Leases a simulator may serve before it is recycled
    pub simulator_max_usage_limit: u32,

    /// Leases an emulator may serve before it is recycled
    pub emulator_max_usage_limit: u32,

    /// Reconciliation poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Flags applied to every boot on top of per-request options
    pub boot_options: BootOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_simulators_count: 5,
            max_emulators_count: 1,
            simulator_max_usage_limit: 10,
            emulator_max_usage_limit: 1,
            poll_interval_ms: 5_000,
            boot_options: BootOptions::default(),
        }
    }
}

impl PoolConfig {
    /// Ceiling for a platform
    pub fn max_count(&self, platform: Platform) -> usize {
        match platform {
            Platform::Android => self.max_emulators_count,
            Platform::Ios => self.max_simulators_count,
        }
    }

    /// Usage limit for a platform
    pub fn usage_limit(&self, platform: Platform) -> u32 {
        match platform {
            Platform::Android => self.emulator_max_usage_limit,
            Platform::Ios => self.simulator_max_usage_limit,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup
    ///
    /// Unparseable values are logged and ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = env_value(&lookup, ENV_MAX_SIMULATORS) {
            self.max_simulators_count = v;
        }
        if let Some(v) = env_value(&lookup, ENV_MAX_EMULATORS) {
            self.max_emulators_count = v;
        }
        if let Some(v) = env_value(&lookup, ENV_SIM_USAGE_LIMIT) {
            self.simulator_max_usage_limit = v;
        }
        if let Some(v) = env_value(&lookup, ENV_EMU_USAGE_LIMIT) {
            self.emulator_max_usage_limit = v;
        }
        if let Some(v) = env_value(&lookup, ENV_POLL_INTERVAL) {
            self.poll_interval_ms = v;
        }
    }
}

fn env_value<T, F>(lookup: &F, names: &[&str]) -> Option<T>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    let (name, raw) = names
        .iter()
        .find_map(|name| lookup(name).map(|value| (*name, value)))?;

    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number", name, raw);
            None
        }
    }
}

/// Load a config file, falling back to defaults if missing or invalid
pub fn load_config_file(config_path: &Path) -> PoolConfig {
    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return PoolConfig::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                debug!("Loaded pool config from {:?}", config_path);
                config
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                PoolConfig::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            PoolConfig::default()
        }
    }
}

/// Full config resolution: defaults, then the file, then the environment
pub fn load_config(config_path: &Path) -> Result<PoolConfig> {
    let mut config = load_config_file(config_path);
    config.apply_env();
    config.validate()?;
    info!("Device pool config: {:?}", config);
    Ok(config)
}

/// Default config path inside a project directory
pub fn default_config_path(project_path: &Path) -> std::path::PathBuf {
    project_path.join(DEVPOOL_DIR).join(CONFIG_FILENAME)
}

/// Default snapshot path inside a project directory
pub fn default_snapshot_path(project_path: &Path) -> std::path::PathBuf {
    project_path.join(DEVPOOL_DIR).join(SNAPSHOT_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_count(Platform::Ios), 5);
        assert_eq!(config.max_count(Platform::Android), 1);
        assert_eq!(config.usage_limit(Platform::Ios), 10);
        assert_eq!(config.usage_limit(Platform::Android), 1);
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = load_config_file(&default_config_path(dir.path()));
        assert_eq!(config, PoolConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = default_config_path(dir.path());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "max_emulators_count = 3\n\n[boot_options]\nheadless = true\n",
        )
        .unwrap();

        let config = load_config_file(&path);
        assert_eq!(config.max_emulators_count, 3);
        assert!(config.boot_options.headless);
        assert_eq!(config.max_simulators_count, 5);
    }

    #[test]
    fn test_load_invalid_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "max_emulators_count = \"lots\"").unwrap();
        assert_eq!(load_config_file(&path), PoolConfig::default());
    }

    #[test]
    fn test_env_overrides_and_aliases() {
        let mut config = PoolConfig::default();
        config.apply_env_with(lookup(&[
            ("MAX_SIM_COUNT", "2"),
            ("EMULATOR_MAX_USAGE_LIMIT", "4"),
            ("DEVPOOL_POLL_INTERVAL_MS", "250"),
        ]));

        assert_eq!(config.max_simulators_count, 2);
        assert_eq!(config.emulator_max_usage_limit, 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.max_emulators_count, 1);
    }

    #[test]
    fn test_primary_env_name_wins_over_alias() {
        let mut config = PoolConfig::default();
        config.apply_env_with(lookup(&[
            ("MAX_EMULATORS_COUNT", "7"),
            ("MAX_EMU_COUNT", "9"),
        ]));
        assert_eq!(config.max_emulators_count, 7);
    }

    #[test]
    fn test_unparseable_env_is_ignored() {
        let mut config = PoolConfig::default();
        config.apply_env_with(lookup(&[("SIM_USAGE_LIMIT", "ten")]));
        assert_eq!(config.simulator_max_usage_limit, 10);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = PoolConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().unwrap_err().is_fatal());
    }

    #[test]
    #[serial]
    fn test_load_config_reads_process_env() {
        let dir = tempdir().unwrap();
        std::env::set_var("MAX_SIMULATORS_COUNT", "8");
        let config = load_config(&default_config_path(dir.path())).unwrap();
        std::env::remove_var("MAX_SIMULATORS_COUNT");

        assert_eq!(config.max_simulators_count, 8);
    }
}
