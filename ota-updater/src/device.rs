//! Device conditions that gate installation.
//!
//! An installation must not start on a nearly empty battery, and not while a
//! scratch overlay (left behind by a writable remount of the system
//! partitions) is mounted.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::DeviceConfig;
use crate::traits::{BatteryState, DeviceConditions};

/// Why an installation cannot start right now.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum InstallBlocker {
    #[error("battery at {percent}%, at least {required}% required")]
    BatteryLow { percent: u8, required: u8 },

    #[error("scratch overlay is mounted")]
    ScratchMounted,
}

/// Battery thresholds applied before an installation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallGuard {
    /// Minimum charge while running on battery
    pub battery_ok_discharging: u8,
    /// Minimum charge while plugged in
    pub battery_ok_charging: u8,
}

impl Default for InstallGuard {
    fn default() -> Self {
        Self {
            battery_ok_discharging: 30,
            battery_ok_charging: 20,
        }
    }
}

impl InstallGuard {
    /// First condition that prevents an installation, if any. A device
    /// without a battery always passes the power check.
    pub fn check(&self, device: &dyn DeviceConditions) -> Option<InstallBlocker> {
        if let Some(battery) = device.battery() {
            let required = if battery.charging {
                self.battery_ok_charging
            } else {
                self.battery_ok_discharging
            };
            if battery.percent < required {
                return Some(InstallBlocker::BatteryLow {
                    percent: battery.percent,
                    required,
                });
            }
        }
        if device.is_scratch_mounted() {
            return Some(InstallBlocker::ScratchMounted);
        }
        None
    }
}

/// Reads the power supply class in sysfs and the mount table.
pub struct SysfsDeviceConditions {
    power_supply_dir: PathBuf,
    mounts_file: PathBuf,
    scratch_mount: String,
}

impl SysfsDeviceConditions {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            power_supply_dir: config.power_supply_dir.clone(),
            mounts_file: config.mounts_file.clone(),
            scratch_mount: config.scratch_mount.clone(),
        }
    }
}

fn read_attr(supply: &Path, name: &str) -> Option<String> {
    fs::read_to_string(supply.join(name))
        .ok()
        .map(|s| s.trim().to_string())
}

impl DeviceConditions for SysfsDeviceConditions {
    fn battery(&self) -> Option<BatteryState> {
        let entries = match fs::read_dir(&self.power_supply_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(path = %self.power_supply_dir.display(), error = %e, "No power supply information");
                return None;
            }
        };

        let mut percent = None;
        let mut charging = false;
        for entry in entries.flatten() {
            let supply = entry.path();
            match read_attr(&supply, "type").as_deref() {
                Some("Battery") => {
                    if read_attr(&supply, "present").as_deref() == Some("0") {
                        continue;
                    }
                    percent = read_attr(&supply, "capacity").and_then(|c| c.parse::<u8>().ok());
                    if matches!(read_attr(&supply, "status").as_deref(), Some("Charging" | "Full")) {
                        charging = true;
                    }
                }
                Some(_) => {
                    if read_attr(&supply, "online").as_deref() == Some("1") {
                        charging = true;
                    }
                }
                None => {}
            }
        }

        percent.map(|percent| BatteryState {
            percent: percent.min(100),
            charging,
        })
    }

    fn is_scratch_mounted(&self) -> bool {
        match fs::read_to_string(&self.mounts_file) {
            Ok(mounts) => mounts
                .lines()
                .any(|line| line.split_whitespace().nth(1) == Some(self.scratch_mount.as_str())),
            Err(e) => {
                debug!(path = %self.mounts_file.display(), error = %e, "Mount table unreadable");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDeviceConditions;
    use tempfile::TempDir;

    fn supply(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        for (attr, value) in attrs {
            fs::write(dir.join(attr), format!("{}\n", value)).unwrap();
        }
    }

    fn sysfs(dir: &TempDir) -> SysfsDeviceConditions {
        SysfsDeviceConditions::new(&DeviceConfig {
            power_supply_dir: dir.path().join("power_supply"),
            mounts_file: dir.path().join("mounts"),
            ..DeviceConfig::default()
        })
    }

    #[test]
    fn test_guard_thresholds_depend_on_charging() {
        let guard = InstallGuard::default();
        let device = MockDeviceConditions::new();
        assert_eq!(guard.check(&device), None);

        device.set_battery(25, false);
        assert_eq!(
            guard.check(&device),
            Some(InstallBlocker::BatteryLow {
                percent: 25,
                required: 30
            })
        );

        device.set_battery(25, true);
        assert_eq!(guard.check(&device), None);

        device.set_scratch_mounted(true);
        assert_eq!(guard.check(&device), Some(InstallBlocker::ScratchMounted));
    }

    #[test]
    fn test_sysfs_battery_and_charger() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("power_supply");
        supply(&root, "battery", &[("type", "Battery"), ("capacity", "42"), ("status", "Discharging")]);
        supply(&root, "usb", &[("type", "USB"), ("online", "0")]);

        let device = sysfs(&dir);
        assert_eq!(
            device.battery(),
            Some(BatteryState {
                percent: 42,
                charging: false
            })
        );

        supply(&root, "usb", &[("online", "1")]);
        assert!(device.battery().unwrap().charging);
    }

    #[test]
    fn test_sysfs_without_battery() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("power_supply");
        supply(&root, "mains", &[("type", "Mains"), ("online", "1")]);
        supply(&root, "battery", &[("type", "Battery"), ("present", "0"), ("capacity", "0")]);

        assert_eq!(sysfs(&dir).battery(), None);
        assert_eq!(InstallGuard::default().check(&sysfs(&dir)), None);
    }

    #[test]
    fn test_scratch_mount_detection() {
        let dir = TempDir::new().unwrap();
        let device = sysfs(&dir);
        assert!(!device.is_scratch_mounted());

        fs::write(
            dir.path().join("mounts"),
            "/dev/block/dm-0 / ext4 ro 0 0\n/dev/block/dm-5 /mnt/scratch f2fs rw 0 0\n",
        )
        .unwrap();
        assert!(device.is_scratch_mounted());

        fs::write(dir.path().join("mounts"), "/dev/block/dm-0 /mnt/scratchpad ext4 rw 0 0\n").unwrap();
        assert!(!device.is_scratch_mounted());
    }
}
