//! Configuration file loading.
//!
//! The file is TOML, auto-detected as `chanwatch.toml` in the working
//! directory or passed with `--config`. Every key is optional.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "chanwatch.toml";

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub crawler: CrawlerSection,
    #[serde(default)]
    pub ledger: LedgerSection,
}

#[derive(Debug, Deserialize, Default)]
pub struct DatabaseSection {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct CrawlerSection {
    pub check_interval_secs: Option<u64>,
    pub retry_backoff_ms: Option<u64>,
    pub heartbeat_secs: Option<u64>,
    pub cookie_dir: Option<String>,
    /// Home directory scanned for browser profiles instead of `$HOME`.
    pub browser_home: Option<String>,
    /// Path or name of the downloader executable.
    pub downloader: Option<String>,
    /// Download directory for channels without their own.
    pub output_dir: Option<String>,
    /// Upper bound for one listing run of the downloader.
    pub scrape_timeout_secs: Option<u64>,
    /// Upper bound for one video download.
    pub fetch_timeout_secs: Option<u64>,
    /// Form field names used when logging in with stored credentials.
    pub login_username_field: Option<String>,
    pub login_password_field: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LedgerSection {
    /// Hostname to cooldown minutes, layered over the built-in table.
    #[serde(default)]
    pub cooldowns: HashMap<String, u64>,
}

/// Load a configuration file.
pub fn load_config(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Explicit path, else `chanwatch.toml` if present.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit.map(Path::to_path_buf).or_else(|| {
        let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
        default_path.exists().then_some(default_path)
    })
}
