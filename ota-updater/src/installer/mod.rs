//! Installation mechanisms.
//!
//! - [`AbSlotInstaller`] writes the package into the inactive slot and marks
//!   it for the next boot. Supports suspend and resume.
//! - [`LegacyInstaller`] stages the package and leaves a command for the
//!   recovery environment.

mod ab;
mod legacy;

pub use ab::{parse_slot, AbSlotInstaller, AbSlotState, Slot};
pub use legacy::LegacyInstaller;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{InstallMode, UpdaterConfig};
use crate::traits::Installer;

/// Build the installer selected by the configuration.
pub fn build_installer(config: &UpdaterConfig) -> Arc<dyn Installer> {
    let use_ab = match config.install_mode {
        InstallMode::Ab => true,
        InstallMode::Legacy => false,
        InstallMode::Auto => match std::fs::read_to_string(&config.ab.cmdline) {
            Ok(cmdline) => parse_slot(&cmdline).is_some(),
            Err(e) => {
                warn!(
                    path = %config.ab.cmdline.display(),
                    error = %e,
                    "Could not read kernel command line, using legacy installer"
                );
                false
            }
        },
    };

    if use_ab {
        info!("Using A/B slot installer");
        Arc::new(AbSlotInstaller::new(&config.ab))
    } else {
        info!("Using legacy recovery installer");
        Arc::new(LegacyInstaller::new(&config.legacy))
    }
}
