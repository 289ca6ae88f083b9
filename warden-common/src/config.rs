//! Configuration loading and root folder resolution

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Root folder resolution priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. TOML config file
/// 4. OS-dependent compiled default (fallback)
pub fn resolve_root_folder(cli_arg: Option<&str>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Ok(PathBuf::from(path));
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        return Ok(PathBuf::from(path));
    }

    // Priority 3: TOML config file
    if let Ok(config_path) = find_config_file() {
        if let Ok(toml_content) = std::fs::read_to_string(&config_path) {
            if let Ok(config) = toml::from_str::<toml::Value>(&toml_content) {
                if let Some(root_folder) = config.get("root_folder").and_then(|v| v.as_str()) {
                    return Ok(PathBuf::from(root_folder));
                }
            }
        }
    }

    // Priority 4: OS-dependent compiled default
    Ok(get_default_root_folder())
}

/// Get default configuration file path for the platform
fn find_config_file() -> Result<PathBuf> {
    if cfg!(target_os = "linux") {
        // Try ~/.config/warden/warden.toml first, then /etc/warden/warden.toml
        let user_config = dirs::config_dir().map(|d| d.join("warden").join("warden.toml"));
        let system_config = PathBuf::from("/etc/warden/warden.toml");

        if let Some(path) = user_config {
            if path.exists() {
                return Ok(path);
            }
        }
        if system_config.exists() {
            return Ok(system_config);
        }
        return Err(Error::Config("No config file found".to_string()));
    }

    let config_path = dirs::config_dir()
        .map(|d| d.join("warden").join("warden.toml"))
        .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))?;

    if config_path.exists() {
        Ok(config_path)
    } else {
        Err(Error::Config(format!("Config file not found: {:?}", config_path)))
    }
}

/// Get OS-dependent default root folder path
fn get_default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        dirs::data_local_dir()
            .map(|d| d.join("warden"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/warden"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("warden"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/warden"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("warden"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\warden"))
    } else {
        PathBuf::from("./warden_data")
    }
}

/// Bootstrap configuration from `warden.toml`
///
/// Holds only what is needed before the database is open; everything
/// tunable at runtime lives in the settings table behind the PolicyCache.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WardenToml {
    /// Shared root folder override
    pub root_folder: Option<String>,

    /// Database path override (default: `<root>/warden.db`)
    pub database_path: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub review: ReviewServiceConfig,

    #[serde(default)]
    pub scan: ScanServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewServiceConfig {
    #[serde(default = "default_review_port")]
    pub port: u16,
}

impl Default for ReviewServiceConfig {
    fn default() -> Self {
        Self { port: default_review_port() }
    }
}

fn default_review_port() -> u16 {
    7351
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanServiceConfig {
    #[serde(default = "default_scan_port")]
    pub port: u16,

    /// Remote detector endpoint; when absent, rescans complete without
    /// producing new findings.
    pub detector_endpoint: Option<String>,

    /// API key sent to the detector endpoint
    pub detector_api_key: Option<String>,
}

impl Default for ScanServiceConfig {
    fn default() -> Self {
        Self {
            port: default_scan_port(),
            detector_endpoint: None,
            detector_api_key: None,
        }
    }
}

fn default_scan_port() -> u16 {
    7352
}

impl WardenToml {
    /// Load `warden.toml` from the root folder, falling back to defaults
    /// when the file is absent or unreadable.
    pub fn load(root_folder: &Path) -> Self {
        let path = root_folder.join("warden.toml");
        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<WardenToml>(&content) {
                Ok(config) => {
                    debug!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to parse {}: {} - using defaults", path.display(), e);
                    WardenToml::default()
                }
            },
            Err(_) => {
                debug!("No warden.toml at {} - using defaults", path.display());
                WardenToml::default()
            }
        }
    }

    /// Resolve the database path: explicit override or `<root>/warden.db`.
    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        match &self.database_path {
            Some(p) => PathBuf::from(p),
            None => root_folder.join("warden.db"),
        }
    }
}
