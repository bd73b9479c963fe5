//! Command-line argument parsing.

use clap::Parser;

/// OTA update daemon - downloads, verifies and installs system updates
#[derive(Parser, Debug, Default)]
#[command(name = "ota-updaterd")]
#[command(about = "OTA update daemon - downloads, verifies and installs system updates")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "OTA_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Log format (pretty, json)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Listen address for the HTTP API
    #[arg(long)]
    pub listen: Option<String>,

    /// URL of the update list
    #[arg(long, env = "OTA_SERVER_URL")]
    pub server_url: Option<String>,

    /// Enable development mode (mock transfers and installer, in-memory state)
    #[arg(long)]
    pub dev: bool,

    /// Check for updates right after startup
    #[arg(long)]
    pub check_now: bool,
}
