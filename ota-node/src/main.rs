//! # OTA Update Daemon
//!
//! Hosts the update lifecycle controller and its background service, and
//! exposes both to presenters over an HTTP API with a WebSocket event stream.
//!
//! ## Usage
//! ```bash
//! ota-updaterd --config /etc/ota-updater/updater.yaml
//! ota-updaterd --dev --check-now
//! ```

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use ota_updater::mock::MockManifestSource;
use ota_updater::{BuildInfo, Collaborators, Manifest, ManifestEntry, UpdaterService};
use tracing::{error, info, warn};

mod cli;
mod config;
mod http_server;

use cli::Args;
use config::ConfigSource;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so the configured format applies
    let (config, source) = config::resolve(&args)?;

    // Initialize logging
    ota_common::init_logging(&args.log_level, config.log_format()?)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting OTA update daemon"
    );

    match &source {
        ConfigSource::File(path) => info!(config_path = %path.display(), "Configuration loaded"),
        ConfigSource::DefaultFile(path) => {
            info!(config_path = %path.display(), "Configuration loaded from default location")
        }
        ConfigSource::Defaults => info!("No config file found, using CLI arguments and defaults"),
    }

    info!(
        server_url = %config.updater.server_url,
        download_dir = %config.updater.download_dir.display(),
        import_dir = %config.updater.import_dir.display(),
        install_mode = ?config.updater.install_mode,
        check_interval = %config.updater.check_interval,
        dev = config.dev,
        "Update daemon configured"
    );

    let collaborators = if config.dev {
        warn!("Development mode: transfers, verification and installation are simulated");
        dev_collaborators(&config.updater.build)?
    } else {
        Collaborators::from_config(&config.updater)?
    };

    let handle = UpdaterService::start(config.updater.clone(), collaborators).await?;

    if args.check_now {
        let checker = handle.clone();
        tokio::spawn(async move {
            match checker.check_now().await {
                Ok(outcome) => info!(
                    updates = outcome.updates.len(),
                    new_updates = outcome.new_updates,
                    "Startup update check finished"
                ),
                Err(e) => warn!(error = %e, "Startup update check failed"),
            }
        });
    }

    let http = async {
        if !config.http.enabled {
            info!("HTTP API disabled");
            return std::future::pending::<Result<()>>().await;
        }
        let addr: SocketAddr = config
            .http
            .listen_address
            .parse()
            .with_context(|| format!("Invalid listen address: {}", config.http.listen_address))?;
        let state = http_server::AppState {
            handle: handle.clone(),
            import_dir: config.updater.import_dir.clone(),
        };
        http_server::run_http_server(addr, state, &config.http.cors_origins).await
    };

    let result = tokio::select! {
        result = http => {
            if let Err(e) = &result {
                error!(error = %e, "HTTP API server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    handle.shutdown().await;
    info!("OTA update daemon stopped");
    result
}

/// Mock collaborators serving a small update list built for the running
/// version, so every lifecycle path can be walked without a server.
fn dev_collaborators(build: &BuildInfo) -> Result<Collaborators> {
    let newest = build.timestamp.max(0) + 86_400;
    let manifest = Manifest {
        response: vec![
            dev_entry(build, newest, "dev-update-2"),
            dev_entry(build, newest - 3_600, "dev-update-1"),
        ],
    };
    let body = serde_json::to_vec(&manifest).context("Failed to encode development update list")?;

    let mut collaborators = Collaborators::mock();
    collaborators.manifest_source = std::sync::Arc::new(MockManifestSource::with_body(body));
    Ok(collaborators)
}

fn dev_entry(build: &BuildInfo, datetime: i64, id: &str) -> ManifestEntry {
    let filename = format!("os-{}-{}.zip", build.version, id);
    ManifestEntry {
        datetime,
        url: format!("mock://{}", filename),
        filename,
        id: id.to_string(),
        romtype: build.release_type.clone(),
        size: 8 * 1024 * 1024,
        version: build.version.clone(),
        sha256: None,
    }
}
