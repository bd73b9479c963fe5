//! Background execution service.
//!
//! The service owns the one controller of the process. It keeps running with
//! no observer attached: scheduled checks and out-of-band commands execute
//! regardless, and a presenter that attaches later gets the same controller
//! through a [`ServiceHandle`].

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checker::{CheckOutcome, HttpManifestSource, UpdateChecker};
use crate::config::UpdaterConfig;
use crate::controller::{ControllerOptions, UpdaterController};
use crate::device::SysfsDeviceConditions;
use crate::downloader::HttpDownloader;
use crate::error::{Result, UpdaterError};
use crate::events::{Subscription, SubscriptionError, UpdateEvent};
use crate::installer::build_installer;
use crate::store::JsonFileStore;
use crate::traits::{Collaborators, StatusStore};
use crate::types::UpdateInfo;
use crate::verifier::Sha256Verifier;

impl Collaborators {
    /// Production collaborators: HTTP transfer and list fetch, SHA-256
    /// verification, the configured installer, the JSON state file and
    /// sysfs device conditions.
    pub fn from_config(config: &UpdaterConfig) -> Result<Self> {
        Ok(Self {
            downloader: Arc::new(HttpDownloader::new()?),
            verifier: Arc::new(Sha256Verifier::new()),
            installer: build_installer(config),
            store: Arc::new(JsonFileStore::open(&config.state_file)?),
            manifest_source: Arc::new(HttpManifestSource::new(config.server_url.clone())?),
            device: Arc::new(SysfsDeviceConditions::new(&config.device)),
        })
    }
}

enum ServiceCommand {
    CheckNow(oneshot::Sender<Result<CheckOutcome>>),
    Shutdown,
}

/// Entry point of the background service.
pub struct UpdaterService;

impl UpdaterService {
    /// Build the controller, restore persisted state and start the run loop.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn start(config: UpdaterConfig, collaborators: Collaborators) -> Result<ServiceHandle> {
        config.validate().map_err(UpdaterError::InvalidConfig)?;

        let options = ControllerOptions {
            download_dir: config.download_dir.clone(),
            auto_delete_updates: config.auto_delete_updates,
            build: config.build.clone(),
            event_capacity: config.event_capacity,
            install_guard: config.device.guard(),
        };
        let controller = UpdaterController::new(options, &collaborators);

        match controller.restore() {
            Ok(count) => debug!(restored = count, "Persisted updates restored"),
            Err(e) => warn!(error = %e, "Failed to restore persisted updates, starting empty"),
        }
        controller.set_performance_mode(config.ab_perf_mode);

        let checker = UpdateChecker::new(
            controller.clone(),
            Arc::clone(&collaborators.manifest_source),
            config.manifest_cache.clone(),
        );
        let cached = checker.load_cached().await;
        debug!(updates = cached, "Replayed cached update list");

        tokio::spawn(log_events(controller.subscribe()));

        let (tx, rx) = mpsc::channel(16);
        let schedule = Schedule {
            interval: config.check_interval_duration(),
            retry: config.retry_interval_duration(),
        };
        tokio::spawn(run_loop(checker, controller.clone(), schedule, rx));

        info!(
            server = %config.server_url,
            interval = %config.check_interval,
            "Updater service started"
        );

        Ok(ServiceHandle {
            controller,
            commands: tx,
            store: Arc::clone(&collaborators.store),
        })
    }
}

/// Cloneable reference to a running service.
#[derive(Clone)]
pub struct ServiceHandle {
    controller: UpdaterController,
    commands: mpsc::Sender<ServiceCommand>,
    store: Arc<dyn StatusStore>,
}

impl ServiceHandle {
    pub fn controller(&self) -> &UpdaterController {
        &self.controller
    }

    /// Snapshot plus subscription, see [`UpdaterController::attach`].
    pub fn attach(&self) -> (Vec<UpdateInfo>, Subscription) {
        self.controller.attach()
    }

    /// Run an update check now and wait for its outcome.
    pub async fn check_now(&self) -> Result<CheckOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(ServiceCommand::CheckNow(reply))
            .await
            .map_err(|_| UpdaterError::ServiceStopped)?;
        outcome.await.map_err(|_| UpdaterError::ServiceStopped)?
    }

    /// Install a verified update.
    pub fn install(&self, download_id: &str) -> Result<()> {
        self.controller.install_update(download_id)
    }

    /// Stop whatever installation is running.
    pub fn stop_install(&self) -> Result<()> {
        self.controller.stop_installation()
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Stop scheduling checks and flush pending state writes. Running
    /// transfers and installs are left alone.
    pub async fn shutdown(&self) {
        if self.commands.send(ServiceCommand::Shutdown).await.is_err() {
            debug!("Updater service already stopped");
        }

        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.flush()).await {
            Ok(Ok(())) => debug!("Updater state flushed"),
            Ok(Err(e)) => error!(error = %e, "Failed to flush updater state"),
            Err(e) => error!(error = %e, "State flush task failed"),
        }
    }
}

struct Schedule {
    interval: Option<Duration>,
    retry: Duration,
}

impl Schedule {
    /// First check: one interval after the last successful check, or right
    /// away when there was none.
    fn first(&self, controller: &UpdaterController) -> Option<Instant> {
        let interval = self.interval?;
        let now = Instant::now();
        let Some(last) = controller.last_check() else {
            return Some(now);
        };
        let elapsed = (Utc::now() - last).to_std().unwrap_or(Duration::ZERO);
        Some(now + interval.saturating_sub(elapsed))
    }

    fn after_success(&self) -> Option<Instant> {
        self.interval.map(|i| Instant::now() + i)
    }
}

async fn run_loop(
    checker: UpdateChecker,
    controller: UpdaterController,
    schedule: Schedule,
    mut commands: mpsc::Receiver<ServiceCommand>,
) {
    let mut next_check = schedule.first(&controller);
    let mut retrying = false;

    loop {
        let deadline = next_check.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            _ = tokio::time::sleep_until(deadline), if next_check.is_some() => {
                match checker.check().await {
                    Ok(outcome) => {
                        if outcome.new_updates {
                            info!(updates = outcome.updates.len(), "New updates available");
                        }
                        retrying = false;
                        next_check = schedule.after_success();
                    }
                    Err(e) if !retrying => {
                        warn!(error = %e, retry_in = ?schedule.retry, "Scheduled update check failed");
                        retrying = true;
                        next_check = Some(Instant::now() + schedule.retry);
                    }
                    Err(e) => {
                        error!(error = %e, "Update check retry failed");
                        retrying = false;
                        next_check = schedule.after_success();
                    }
                }
            }
            command = commands.recv() => match command {
                Some(ServiceCommand::CheckNow(reply)) => {
                    let outcome = checker.check().await;
                    if outcome.is_ok() {
                        retrying = false;
                        next_check = schedule.after_success();
                    }
                    let _ = reply.send(outcome);
                }
                Some(ServiceCommand::Shutdown) | None => break,
            },
        }
    }

    info!("Updater service stopped");
}

async fn log_events(mut events: Subscription) {
    loop {
        match events.recv().await {
            Ok(UpdateEvent::UpdateStatus {
                download_id,
                status,
                reason,
                ..
            }) => match reason {
                Some(reason) => info!(
                    download_id = %download_id,
                    status = %status,
                    reason = ?reason.code,
                    message = ?reason.message,
                    "Update status changed"
                ),
                None => info!(download_id = %download_id, status = %status, "Update status changed"),
            },
            Ok(UpdateEvent::UpdateRemoved { download_id }) => {
                info!(download_id = %download_id, "Update removed");
            }
            Ok(event) => debug!(event = ?event, "Update progress"),
            Err(SubscriptionError::Lagged(missed)) => {
                warn!(missed = missed, "Event logger fell behind");
            }
            Err(SubscriptionError::Closed) => break,
        }
    }
}
