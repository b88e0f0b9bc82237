//! Configuration file support for kflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (KFLASH_*)
//! 3. File given with `--config`
//! 4. Local config file (./kflash.toml or ./.kflash.toml)
//! 5. Global config file (e.g. ~/.config/kflash/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Local file names, checked in order.
const LOCAL_CONFIG_FILES: [&str; 2] = ["kflash.toml", ".kflash.toml"];

/// Serial port configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub default: Option<String>,
    /// Target baud rate.
    pub baud: Option<u32>,
    /// Board profile name.
    pub board: Option<String>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashConfig {
    /// Flash-mode stub binary.
    pub bootloader: Option<PathBuf>,
    /// SPI read mode written into the image header ("dio" or "qio").
    pub io_mode: Option<String>,
    /// Flash chip selector (0 = in-chip, 1 = on-board).
    pub chip: Option<u8>,
    /// Skip the stage-0 fast-mode baud change.
    #[serde(default)]
    pub slow: bool,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load the global and local files, then `extra` on top.
    pub fn load(extra: Option<&Path>) -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global);
            }
        }

        for name in LOCAL_CONFIG_FILES {
            if let Some(local) = Self::load_from_file(Path::new(name)) {
                debug!("Loaded local config from {name}");
                config.merge(local);
                break;
            }
        }

        if let Some(path) = extra {
            if let Some(explicit) = Self::load_from_file(path) {
                debug!("Loaded config from {}", path.display());
                config.merge(explicit);
            } else {
                warn!("Could not load config from {}, ignoring it", path.display());
            }
        }

        config
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content)
                .map_err(|e| warn!("Failed to parse config file {}: {e}", path.display()))
                .ok(),
            Err(e) => {
                warn!("Failed to read config file {}: {e}", path.display());
                None
            },
        }
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "kflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one. Values set in `other` win.
    fn merge(&mut self, other: Self) {
        if other.port.default.is_some() {
            self.port.default = other.port.default;
        }
        if other.port.baud.is_some() {
            self.port.baud = other.port.baud;
        }
        if other.port.board.is_some() {
            self.port.board = other.port.board;
        }

        if other.flash.bootloader.is_some() {
            self.flash.bootloader = other.flash.bootloader;
        }
        if other.flash.io_mode.is_some() {
            self.flash.io_mode = other.flash.io_mode;
        }
        if other.flash.chip.is_some() {
            self.flash.chip = other.flash.chip;
        }
        if other.flash.slow {
            self.flash.slow = true;
        }
    }
}
