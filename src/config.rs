//! Configuration file handling
//!
//! Settings live in a TOML file. Without an explicit path the platform
//! config directory is used:
//! - Linux: ~/.config/plugchain/config.toml
//! - Windows: %APPDATA%\plugchain\config.toml
//! - macOS: ~/Library/Application Support/plugchain/config.toml
//!
//! A missing default file means defaults; a missing explicit file is an error.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::audio::EngineConfig;

/// Application name used for configuration directory
const APP_NAME: &str = "plugchain";

const MAX_BLOCK_SIZE: usize = 65536;
const MIN_SAMPLE_RATE: u32 = 8000;
const MAX_SAMPLE_RATE: u32 = 384000;

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Processing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioSection {
    /// Frames per plugin block
    pub block_size: usize,
    /// Chain sample rate in Hz
    pub sample_rate: u32,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            block_size: 1024,
            sample_rate: 44100,
        }
    }
}

/// Streaming loop timing, all in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlaybackSection {
    pub buffer_ceiling_ms: u64,
    pub pause_poll_ms: u64,
    pub backpressure_poll_ms: u64,
    pub empty_read_retry_ms: u64,
    pub capture_queue_ms: u64,
    pub output_buffer_ms: u64,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            buffer_ceiling_ms: 300,
            pause_poll_ms: 50,
            backpressure_poll_ms: 50,
            empty_read_retry_ms: 10,
            capture_queue_ms: 1000,
            output_buffer_ms: 2000,
        }
    }
}

/// Device selection (None = system default)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DevicesSection {
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioSection,
    pub playback: PlaybackSection,
    pub devices: DevicesSection,
}

impl AppConfig {
    /// Load from `path`, or from the default location when `None`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load_from(&path),
                _ => {
                    debug!("No config file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    /// Load and validate the file at `path`
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        let audio = &self.audio;
        if audio.block_size == 0 || audio.block_size > MAX_BLOCK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "block_size {} must be between 1 and {}",
                audio.block_size, MAX_BLOCK_SIZE
            )));
        }
        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&audio.sample_rate) {
            return Err(ConfigError::Invalid(format!(
                "sample_rate {} must be between {} and {}",
                audio.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }

        let playback = &self.playback;
        if playback.buffer_ceiling_ms == 0 {
            return Err(ConfigError::Invalid(
                "buffer_ceiling_ms must be greater than zero".to_string(),
            ));
        }
        if playback.output_buffer_ms <= playback.buffer_ceiling_ms {
            return Err(ConfigError::Invalid(format!(
                "output_buffer_ms ({}) must be larger than buffer_ceiling_ms ({})",
                playback.output_buffer_ms, playback.buffer_ceiling_ms
            )));
        }
        if playback.capture_queue_ms == 0 {
            return Err(ConfigError::Invalid(
                "capture_queue_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Streaming engine settings derived from this configuration
    pub fn engine_config(&self) -> EngineConfig {
        let playback = &self.playback;
        EngineConfig {
            block_size: self.audio.block_size,
            sample_rate: self.audio.sample_rate,
            buffer_ceiling: Duration::from_millis(playback.buffer_ceiling_ms),
            pause_poll: Duration::from_millis(playback.pause_poll_ms),
            backpressure_poll: Duration::from_millis(playback.backpressure_poll_ms),
            empty_read_retry: Duration::from_millis(playback.empty_read_retry_ms),
            capture_queue: Duration::from_millis(playback.capture_queue_ms),
            output_buffer: Duration::from_millis(playback.output_buffer_ms),
        }
    }
}

/// Default configuration file location, if the platform has one
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join("config.toml"))
}
