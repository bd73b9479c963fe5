//! # OTA Common
//!
//! Shared utilities for the OTA updater binaries.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use ota_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(download_id = "abc", "Download started");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json, init_logging_pretty, LogFormat};
