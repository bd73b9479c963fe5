//! # OTA Updater
//!
//! Lifecycle controller for operating-system update packages: discovery,
//! resumable download, integrity verification and installation (A/B slot or
//! legacy recovery), with restart-durable state and a publish/subscribe event
//! stream for presenters.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  commands/queries  ┌────────────────────┐
//! │  Presenter   │───────────────────►│ UpdaterController  │
//! │ (HTTP / UI)  │◄───── events ──────│  registry + store  │
//! └──────────────┘                    └─────────┬──────────┘
//!                                               │ workers
//!                          ┌────────────────────┼─────────────────────┐
//!                          ▼                    ▼                     ▼
//!                    ┌───────────┐        ┌───────────┐         ┌───────────┐
//!                    │Downloader │        │ Verifier  │         │ Installer │
//!                    └───────────┘        └───────────┘         └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ota_updater::{UpdaterConfig, UpdaterService, Collaborators};
//!
//! let config = UpdaterConfig::default();
//! let collaborators = Collaborators::from_config(&config)?;
//! let handle = UpdaterService::start(config, collaborators).await?;
//!
//! let (snapshot, mut events) = handle.attach();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

pub mod checker;
pub mod config;
pub mod controller;
pub mod device;
pub mod downloader;
pub mod error;
pub mod events;
pub mod installer;
pub mod manifest;
pub mod mock;
pub mod presenter;
pub mod service;
pub mod status;
pub mod store;
pub mod traits;
pub mod types;
pub mod verifier;

pub use checker::{CheckOutcome, HttpManifestSource, UpdateChecker};
pub use config::{parse_duration, DeviceConfig, InstallMode, UpdaterConfig};
pub use controller::{ControllerOptions, UpdaterController};
pub use device::{InstallBlocker, InstallGuard, SysfsDeviceConditions};
pub use downloader::HttpDownloader;
pub use error::{InstallError, Result, StoreError, TransferError, UpdaterError, VerifyError};
pub use events::{EventChannel, Reason, ReasonCode, Subscription, SubscriptionError, UpdateEvent};
pub use installer::{build_installer, AbSlotInstaller, LegacyInstaller, Slot};
pub use manifest::{has_new_updates, Manifest, ManifestEntry};
pub use presenter::{
    can_install, derive_view, latest_update, Action, ActionButton, Headline, Notice,
    ProgressMessage, ProgressView, UpdateView, ViewContext,
};
pub use service::{ServiceHandle, UpdaterService};
pub use status::{is_active_layout, PersistentStatus, UpdateStatus};
pub use store::{JsonFileStore, MemoryStore};
pub use traits::{
    BatteryState, CancelFlag, Collaborators, DeviceConditions, DownloadRequest, Downloader, InstallListener, InstallRequest,
    Installer, ManifestSource, ResponseInfo, StatusStore, TransferListener, Verifier,
};
pub use types::{BuildInfo, LocalImport, StoredUpdate, UpdateInfo, LOCAL_ID};
pub use verifier::Sha256Verifier;
