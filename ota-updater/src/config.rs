//! Updater configuration
//!
//! Configuration for the update lifecycle service, typically loaded from
//! /etc/ota-updater/updater.yaml under the `updater` section.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::InstallGuard;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::types::BuildInfo;

/// How packages are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallMode {
    /// A/B when the kernel command line names a boot slot, legacy otherwise.
    #[default]
    Auto,
    Ab,
    Legacy,
}

/// Updater configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// URL of the update list
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Directory that holds downloaded packages
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Persisted update status
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Last fetched update list
    #[serde(default = "default_manifest_cache")]
    pub manifest_cache: PathBuf,

    /// How often to check for updates (e.g., "1d", "12h"); "never" disables
    #[serde(default = "default_check_interval")]
    pub check_interval: String,

    /// Delay before retrying a failed check
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,

    /// Only packages below this directory may be imported locally
    #[serde(default = "default_import_dir")]
    pub import_dir: PathBuf,

    /// Delete packages once they are installed
    #[serde(default)]
    pub auto_delete_updates: bool,

    /// Let the installer use more resources during A/B installs
    #[serde(default)]
    pub ab_perf_mode: bool,

    #[serde(default)]
    pub install_mode: InstallMode,

    /// Undelivered events kept per observer
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub build: BuildInfo,

    #[serde(default)]
    pub ab: AbConfig,

    #[serde(default)]
    pub legacy: LegacyConfig,

    #[serde(default)]
    pub device: DeviceConfig,
}

/// A/B slot installer paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbConfig {
    /// Kernel command line to detect the booted slot from
    #[serde(default = "default_cmdline")]
    pub cmdline: PathBuf,

    /// Image target for slot A
    #[serde(default = "default_slot_a")]
    pub slot_a: PathBuf,

    /// Image target for slot B
    #[serde(default = "default_slot_b")]
    pub slot_b: PathBuf,

    /// Slot switch state read by the bootloader
    #[serde(default = "default_ab_state_file")]
    pub state_file: PathBuf,
}

/// Legacy (recovery) installer paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyConfig {
    /// Where the package is staged for recovery
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,

    /// Recovery command file
    #[serde(default = "default_command_file")]
    pub command_file: PathBuf,
}

/// Where power and mount state is read from, and the battery levels an
/// installation needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_power_supply_dir")]
    pub power_supply_dir: PathBuf,

    #[serde(default = "default_mounts_file")]
    pub mounts_file: PathBuf,

    /// Mount point of the overlay scratch partition
    #[serde(default = "default_scratch_mount")]
    pub scratch_mount: String,

    /// Minimum battery percentage on battery power
    #[serde(default = "default_battery_ok_discharging")]
    pub battery_ok_percentage_discharging: u8,

    /// Minimum battery percentage while charging
    #[serde(default = "default_battery_ok_charging")]
    pub battery_ok_percentage_charging: u8,
}

impl DeviceConfig {
    pub fn guard(&self) -> InstallGuard {
        InstallGuard {
            battery_ok_discharging: self.battery_ok_percentage_discharging,
            battery_ok_charging: self.battery_ok_percentage_charging,
        }
    }
}

fn default_server_url() -> String {
    "https://download.example.org/api/v1/updates".to_string()
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("/data/ota/updates")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/data/ota/state.json")
}

fn default_manifest_cache() -> PathBuf {
    PathBuf::from("/data/ota/updates.json")
}

fn default_check_interval() -> String {
    "1d".to_string()
}

fn default_retry_interval() -> String {
    "30m".to_string()
}

fn default_import_dir() -> PathBuf {
    PathBuf::from("/data/ota/import")
}

fn default_power_supply_dir() -> PathBuf {
    PathBuf::from("/sys/class/power_supply")
}

fn default_mounts_file() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

fn default_scratch_mount() -> String {
    "/mnt/scratch".to_string()
}

fn default_battery_ok_discharging() -> u8 {
    InstallGuard::default().battery_ok_discharging
}

fn default_battery_ok_charging() -> u8 {
    InstallGuard::default().battery_ok_charging
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_cmdline() -> PathBuf {
    PathBuf::from("/proc/cmdline")
}

fn default_slot_a() -> PathBuf {
    PathBuf::from("/dev/disk/by-partlabel/system_a")
}

fn default_slot_b() -> PathBuf {
    PathBuf::from("/dev/disk/by-partlabel/system_b")
}

fn default_ab_state_file() -> PathBuf {
    PathBuf::from("/data/ota/ab-state.json")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("/data/ota/recovery")
}

fn default_command_file() -> PathBuf {
    PathBuf::from("/cache/recovery/command")
}

impl Default for AbConfig {
    fn default() -> Self {
        Self {
            cmdline: default_cmdline(),
            slot_a: default_slot_a(),
            slot_b: default_slot_b(),
            state_file: default_ab_state_file(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            power_supply_dir: default_power_supply_dir(),
            mounts_file: default_mounts_file(),
            scratch_mount: default_scratch_mount(),
            battery_ok_percentage_discharging: default_battery_ok_discharging(),
            battery_ok_percentage_charging: default_battery_ok_charging(),
        }
    }
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            command_file: default_command_file(),
        }
    }
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            download_dir: default_download_dir(),
            state_file: default_state_file(),
            manifest_cache: default_manifest_cache(),
            import_dir: default_import_dir(),
            check_interval: default_check_interval(),
            retry_interval: default_retry_interval(),
            auto_delete_updates: false,
            ab_perf_mode: false,
            install_mode: InstallMode::Auto,
            event_capacity: default_event_capacity(),
            build: BuildInfo::default(),
            ab: AbConfig::default(),
            legacy: LegacyConfig::default(),
            device: DeviceConfig::default(),
        }
    }
}

impl UpdaterConfig {
    /// Periodic check interval, `None` when periodic checks are disabled.
    pub fn check_interval_duration(&self) -> Option<Duration> {
        if is_never(&self.check_interval) {
            return None;
        }
        parse_duration(&self.check_interval).filter(|d| !d.is_zero())
    }

    /// Delay before retrying a failed check.
    pub fn retry_interval_duration(&self) -> Duration {
        parse_duration(&self.retry_interval).unwrap_or(Duration::from_secs(1800))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server_url.is_empty() {
            return Err("Update server URL cannot be empty".to_string());
        }

        if !is_never(&self.check_interval) && parse_duration(&self.check_interval).is_none() {
            return Err(format!(
                "Invalid check interval '{}'. Use format like '1h', '30m', '1d' or 'never'",
                self.check_interval
            ));
        }

        if parse_duration(&self.retry_interval).is_none() {
            return Err(format!(
                "Invalid retry interval '{}'. Use format like '30s', '5m'",
                self.retry_interval
            ));
        }

        if self.event_capacity == 0 {
            return Err("Event capacity must be greater than zero".to_string());
        }

        let device = &self.device;
        if device.battery_ok_percentage_discharging > 100 || device.battery_ok_percentage_charging > 100 {
            return Err("Battery thresholds must be percentages (0-100)".to_string());
        }

        Ok(())
    }
}

fn is_never(s: &str) -> bool {
    matches!(s.trim(), "never" | "0")
}

/// Parse a duration string like "30s", "5m", "1h", "1d".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let (idx, _) = s.char_indices().last()?;
    let (num, unit) = s.split_at(idx);
    let num: u64 = num.parse().ok()?;

    let seconds = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return None,
    };

    Some(Duration::from_secs(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("0"), Some(Duration::ZERO));
        assert_eq!(parse_duration("invalid"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn test_config_validation() {
        let mut config = UpdaterConfig::default();
        assert!(config.validate().is_ok());

        config.check_interval = "never".to_string();
        assert!(config.validate().is_ok());
        assert_eq!(config.check_interval_duration(), None);

        config.check_interval = "invalid".to_string();
        assert!(config.validate().is_err());

        config.check_interval = "12h".to_string();
        config.event_capacity = 0;
        assert!(config.validate().is_err());

        config.event_capacity = 16;
        config.server_url.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
server_url: "http://updates.local/list"
check_interval: "6h"
install_mode: ab
build:
  version: "21.0"
  timestamp: 1700000000
"#;
        let config: UpdaterConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.install_mode, InstallMode::Ab);
        assert_eq!(config.check_interval_duration(), Some(Duration::from_secs(6 * 3600)));
        assert_eq!(config.build.version, "21.0");
        assert_eq!(config.build.release_type, "nightly");
        assert_eq!(config.retry_interval_duration(), Duration::from_secs(1800));
        assert_eq!(config.ab.cmdline, PathBuf::from("/proc/cmdline"));
        assert_eq!(config.device.guard(), InstallGuard::default());
        assert_eq!(config.import_dir, PathBuf::from("/data/ota/import"));
    }

    #[test]
    fn test_battery_thresholds_validated() {
        let mut config = UpdaterConfig::default();
        config.device.battery_ok_percentage_charging = 101;
        assert!(config.validate().is_err());
    }
}
