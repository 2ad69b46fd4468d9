//! Configuration file support for crabtest.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (CRABTEST_*)
//! 3. Local config file (./crabtest.toml)
//! 4. Global config file (~/.config/crabtest/config.toml)

use crabtest::HarnessConfig;
use directories::ProjectDirs;
use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory for result records.
    pub log_dir: PathBuf,
    /// Harness tunables passed through to the library.
    pub harness: HarnessConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("log"),
            harness: HarnessConfig::default(),
        }
    }
}

/// On-disk shape of one config file.
///
/// Sections are optional so a file can override just what it needs; a
/// present `[harness]` table replaces the harness settings wholesale, with
/// unlisted harness keys falling back to their built-in defaults.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    log_dir: Option<PathBuf>,
    harness: Option<HarnessConfig>,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                if let Some(file) = load_file(&global_path) {
                    debug!("Loaded global config from {}", global_path.display());
                    config.merge(file);
                }
            }
        }

        // Load local config (overrides global)
        if let Some(file) = load_file(Path::new("crabtest.toml")) {
            debug!("Loaded local config from crabtest.toml");
            config.merge(file);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        let mut config = Self::default();
        if let Some(file) = load_file(path) {
            debug!("Loaded config from {}", path.display());
            config.merge(file);
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
        }
        config
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "crabtest").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge one config file into this config.
    fn merge(&mut self, file: ConfigFile) {
        if let Some(log_dir) = file.log_dir {
            self.log_dir = log_dir;
        }
        if let Some(harness) = file.harness {
            self.harness = harness;
        }
    }
}

/// Parse one config file, tolerating absence and malformed content.
fn load_file(path: &Path) -> Option<ConfigFile> {
    if !path.exists() {
        return None;
    }

    match fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(file) => Some(file),
            Err(e) => {
                warn!("Failed to parse config file {}: {}", path.display(), e);
                None
            },
        },
        Err(e) => {
            warn!("Failed to read config file {}: {}", path.display(), e);
            None
        },
    }
}
