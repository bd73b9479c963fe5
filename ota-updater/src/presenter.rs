//! Presenter decisions.
//!
//! Pure functions that turn an update record and a few controller flags into
//! what a UI should show: which layout, which buttons, which progress message.
//! Rendering itself is left to the consumer.

use serde::{Deserialize, Serialize};

use crate::device::InstallBlocker;
use crate::status::{is_active_layout, PersistentStatus, UpdateStatus};
use crate::types::{BuildInfo, UpdateInfo};

/// What a button does when pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    CheckUpdates,
    Download,
    Pause,
    Resume,
    Install,
    /// Delete the update, cancelling whatever runs for it.
    CancelInstallation,
    Reboot,
    /// The button is not shown.
    Hide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionButton {
    pub action: Action,
    pub enabled: bool,
}

impl ActionButton {
    pub fn new(action: Action, enabled: bool) -> Self {
        Self { action, enabled }
    }

    pub fn hidden() -> Self {
        Self::new(Action::Hide, false)
    }

    pub fn is_visible(&self) -> bool {
        self.action != Action::Hide
    }
}

/// Main status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Headline {
    UpToDate,
    Downloading,
    DownloadPaused,
    Verifying,
    Installing,
    InstallingLocal,
    InstallationSuspended,
    InstallFinished,
    UpdateAvailable,
    ReadyToInstall,
    LocalUpdate,
}

/// Text under the progress bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMessage {
    Downloading,
    Verifying,
    /// Legacy install staging the package for recovery.
    PreparingPackage,
    /// A/B install writing the inactive slot.
    PreparingFirstBoot,
    /// A/B install finalizing the slot.
    Finalizing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressView {
    pub percent: u8,
    pub indeterminate: bool,
    pub message: ProgressMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloaded_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

/// One-off message raised by a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    DownloadFailed,
    VerificationFailed,
    DownloadVerified,
    /// Install is held back until the device charges.
    BatteryLow,
    /// Install is held back while the scratch overlay is mounted.
    ScratchMounted,
}

impl From<InstallBlocker> for Notice {
    fn from(blocker: InstallBlocker) -> Self {
        match blocker {
            InstallBlocker::BatteryLow { .. } => Notice::BatteryLow,
            InstallBlocker::ScratchMounted => Notice::ScratchMounted,
        }
    }
}

/// Everything a presenter needs to render one update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateView {
    pub active_layout: bool,
    pub headline: Headline,
    pub primary: ActionButton,
    pub secondary: ActionButton,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<Notice>,
}

/// Controller flags the view depends on, captured at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewContext {
    pub is_downloading: bool,
    pub is_verifying: bool,
    pub is_installing: bool,
    pub is_installing_ab: bool,
    pub any_verifying: bool,
    pub waiting_for_reboot: bool,
    pub busy: bool,
    pub can_install: bool,
    /// Device condition currently preventing installation
    pub install_blocker: Option<InstallBlocker>,
}

/// Derive the view for `update`. `None` and deleted updates get the steady
/// "check for updates" view.
pub fn derive_view(update: Option<&UpdateInfo>, ctx: &ViewContext) -> UpdateView {
    let update = match update {
        Some(u) if u.status != UpdateStatus::Deleted => u,
        _ => {
            return UpdateView {
                active_layout: false,
                headline: Headline::UpToDate,
                primary: ActionButton::new(Action::CheckUpdates, true),
                secondary: ActionButton::hidden(),
                progress: None,
                notice: None,
            }
        }
    };

    let active = is_active_layout(update.persistent_status, update.status, ctx.any_verifying);
    let mut view = if active {
        active_view(update, ctx)
    } else {
        steady_view(update, ctx)
    };
    let gated = view.primary.action == Action::Install
        || update.status == UpdateStatus::InstallationSuspended;
    view.notice = match ctx.install_blocker {
        Some(blocker) if gated => Some(Notice::from(blocker)),
        _ => status_notice(update),
    };
    view
}

fn download_progress(update: &UpdateInfo, indeterminate: bool) -> ProgressView {
    ProgressView {
        percent: update.progress,
        indeterminate,
        message: ProgressMessage::Downloading,
        downloaded_bytes: Some(update.downloaded_bytes),
        total_bytes: Some(update.file_size),
    }
}

fn active_view(update: &UpdateInfo, ctx: &ViewContext) -> UpdateView {
    let (headline, primary, progress) = if ctx.is_downloading {
        (
            Headline::Downloading,
            ActionButton::new(Action::Pause, true),
            Some(download_progress(
                update,
                update.status == UpdateStatus::Starting,
            )),
        )
    } else if update.status == UpdateStatus::InstallationSuspended {
        (
            Headline::InstallationSuspended,
            ActionButton::new(Action::Resume, ctx.install_blocker.is_none()),
            None,
        )
    } else if ctx.is_installing {
        let message = if !ctx.is_installing_ab {
            ProgressMessage::PreparingPackage
        } else if update.finalizing {
            ProgressMessage::Finalizing
        } else {
            ProgressMessage::PreparingFirstBoot
        };
        let headline = if update.is_local() {
            Headline::InstallingLocal
        } else {
            Headline::Installing
        };
        (
            headline,
            ActionButton::new(Action::Hide, true),
            Some(ProgressView {
                percent: update.install_progress,
                indeterminate: false,
                message,
                downloaded_bytes: None,
                total_bytes: None,
            }),
        )
    } else if ctx.is_verifying {
        (
            Headline::Verifying,
            ActionButton::hidden(),
            Some(ProgressView {
                percent: update.progress,
                indeterminate: true,
                message: ProgressMessage::Verifying,
                downloaded_bytes: None,
                total_bytes: None,
            }),
        )
    } else {
        (
            Headline::DownloadPaused,
            ActionButton::new(Action::Resume, !ctx.busy),
            Some(download_progress(update, false)),
        )
    };

    UpdateView {
        active_layout: true,
        headline,
        primary,
        secondary: ActionButton::new(Action::CancelInstallation, true),
        progress,
        notice: None,
    }
}

fn steady_view(update: &UpdateInfo, ctx: &ViewContext) -> UpdateView {
    let (headline, primary, show_cancel) = if ctx.waiting_for_reboot {
        (
            Headline::InstallFinished,
            ActionButton::new(Action::Reboot, true),
            false,
        )
    } else if update.persistent_status == PersistentStatus::Verified {
        let primary = if ctx.can_install {
            ActionButton::new(Action::Install, !ctx.busy && ctx.install_blocker.is_none())
        } else {
            ActionButton::hidden()
        };
        (Headline::ReadyToInstall, primary, true)
    } else if !update.is_local() {
        (
            Headline::UpdateAvailable,
            ActionButton::new(Action::Download, !ctx.busy),
            false,
        )
    } else {
        (Headline::LocalUpdate, ActionButton::hidden(), false)
    };

    let secondary = if show_cancel {
        ActionButton::new(Action::CancelInstallation, true)
    } else {
        ActionButton::hidden()
    };

    UpdateView {
        active_layout: false,
        headline,
        primary,
        secondary,
        progress: None,
        notice: None,
    }
}

/// Message raised when an update reaches a noteworthy status. The local
/// import never raises one.
pub fn status_notice(update: &UpdateInfo) -> Option<Notice> {
    if update.is_local() {
        return None;
    }
    match update.status {
        UpdateStatus::PausedError => Some(Notice::DownloadFailed),
        UpdateStatus::VerificationFailed => Some(Notice::VerificationFailed),
        UpdateStatus::Verified => Some(Notice::DownloadVerified),
        _ => None,
    }
}

/// Whether `update` may be installed on `build`: it must target the same OS
/// version and be newer than the running build unless downgrades are allowed.
pub fn can_install(update: &UpdateInfo, build: &BuildInfo) -> bool {
    (build.allow_downgrading || update.timestamp > build.timestamp)
        && update.version.eq_ignore_ascii_case(&build.version)
}

/// The newest known update by build time, ignoring deleted ones.
pub fn latest_update(updates: &[UpdateInfo]) -> Option<&UpdateInfo> {
    updates
        .iter()
        .filter(|u| u.status != UpdateStatus::Deleted)
        .max_by_key(|u| u.timestamp)
}

/// Sort newest build first.
pub fn sort_newest_first(updates: &mut [UpdateInfo]) {
    updates.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}
