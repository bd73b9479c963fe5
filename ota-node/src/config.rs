//! Configuration management for the update daemon.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ota_common::LogFormat;
use ota_updater::UpdaterConfig;
use serde::Deserialize;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ota-updater/updater.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Update lifecycle configuration
    pub updater: UpdaterConfig,
    /// HTTP API configuration
    pub http: HttpConfig,
    /// Logging configuration
    pub log: LogConfig,
    /// Run with mock collaborators
    #[serde(skip)]
    pub dev: bool,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&content).with_context(|| "Failed to parse config file")?;

        Ok(config)
    }

    /// Defaults with CLI overrides applied.
    pub fn default_with_cli(args: &Args) -> Self {
        Self::default().with_cli_overrides(args)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref listen) = args.listen {
            self.http.listen_address = listen.clone();
        }

        if let Some(ref server_url) = args.server_url {
            self.updater.server_url = server_url.clone();
        }

        if let Some(ref format) = args.log_format {
            self.log.format = format.clone();
        }

        if args.dev {
            self.dev = true;
            // Keep development state out of the system directories.
            let root = std::env::temp_dir().join("ota-updaterd");
            self.updater.download_dir = root.join("updates");
            self.updater.state_file = root.join("state.json");
            self.updater.manifest_cache = root.join("updates.json");
            self.updater.import_dir = root.join("import");
        }

        self
    }

    pub fn log_format(&self) -> Result<LogFormat> {
        self.log
            .format
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }
}

/// HTTP API configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to listen on
    pub listen_address: String,
    /// Serve the API at all
    pub enabled: bool,
    /// Browser origins allowed cross-origin access. Empty means none.
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1:8480".to_string(),
            enabled: true,
            cors_origins: Vec::new(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Output format: pretty or json
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: "pretty".to_string(),
        }
    }
}

/// Where the effective configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    DefaultFile(PathBuf),
    Defaults,
}

/// Resolve the configuration: an explicit file must load, the default file
/// is optional.
pub fn resolve(args: &Args) -> Result<(Config, ConfigSource)> {
    match &args.config {
        Some(path) => {
            let config = Config::load(path)?.with_cli_overrides(args);
            Ok((config, ConfigSource::File(PathBuf::from(path))))
        }
        None => match Config::load(DEFAULT_CONFIG_PATH) {
            Ok(config) => Ok((
                config.with_cli_overrides(args),
                ConfigSource::DefaultFile(PathBuf::from(DEFAULT_CONFIG_PATH)),
            )),
            Err(_) => Ok((Config::default_with_cli(args), ConfigSource::Defaults)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_updater::InstallMode;
    use tempfile::TempDir;

    const YAML: &str = r#"
updater:
  server_url: "https://updates.example.org/v1/list"
  check_interval: "12h"
  install_mode: legacy
  build:
    version: "21.0"
    timestamp: 1700000000
    release_type: snapshot
http:
  listen_address: "0.0.0.0:9000"
  cors_origins:
    - "http://localhost:3000"
log:
  format: json
"#;

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("updater.yaml");
        std::fs::write(&path, YAML).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.updater.server_url, "https://updates.example.org/v1/list");
        assert_eq!(config.updater.install_mode, InstallMode::Legacy);
        assert_eq!(config.updater.build.release_type, "snapshot");
        assert_eq!(config.http.listen_address, "0.0.0.0:9000");
        assert!(config.http.enabled);
        assert_eq!(config.http.cors_origins, vec!["http://localhost:3000".to_string()]);
        assert_eq!(config.log_format().unwrap(), LogFormat::Json);
        assert!(config.updater.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args {
            listen: Some("127.0.0.1:1234".to_string()),
            server_url: Some("http://localhost/list".to_string()),
            log_format: Some("pretty".to_string()),
            dev: true,
            ..Args::default()
        };
        let config = Config::default_with_cli(&args);

        assert_eq!(config.http.listen_address, "127.0.0.1:1234");
        assert_eq!(config.updater.server_url, "http://localhost/list");
        assert_eq!(config.log_format().unwrap(), LogFormat::Pretty);
        assert!(config.dev);
        assert!(config.updater.download_dir.starts_with(std::env::temp_dir()));
        assert!(config.updater.import_dir.starts_with(std::env::temp_dir()));
        assert!(config.http.cors_origins.is_empty());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let args = Args {
            config: Some("/nonexistent/updater.yaml".to_string()),
            ..Args::default()
        };
        assert!(resolve(&args).is_err());
    }

    #[test]
    fn test_bad_log_format() {
        let mut config = Config::default();
        config.log.format = "xml".to_string();
        assert!(config.log_format().is_err());
    }
}
