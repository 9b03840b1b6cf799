//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-live/config.toml` as a persistent config
//! source. All fields are optional; the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct LiveConfigFile {
    /// Connection and model settings
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Buffering, timing and device settings
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Tool manifest settings
    #[serde(default)]
    pub tools: ToolsFileConfig,
}

/// `[live]` section
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// Bidirectional endpoint URL
    pub url: Option<String>,

    /// Model identifier (e.g. "models/gemini-2.0-flash-live-001")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Puck")
    pub voice: Option<String>,

    /// System instruction sent at setup
    pub system_instruction: Option<String>,

    /// Setup acknowledgment timeout
    pub setup_timeout_ms: Option<u64>,

    /// API key, appended to the endpoint URL
    pub api_key: Option<String>,

    /// Session mode ("text", "voice", "both")
    pub mode: Option<String>,
}

/// `[audio]` section
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub min_flush_bytes: Option<usize>,
    pub flush_delay_ms: Option<u64>,
    pub frame_bytes: Option<usize>,
    pub settle_delay_ms: Option<u64>,
    pub failsafe_resume_ms: Option<u64>,

    /// Ordered playback backends (e.g. `["cpal", "pw-play"]`)
    pub playback: Option<Vec<String>>,

    /// Ordered capture sources (e.g. `["cpal", "arecord"]`)
    pub capture: Option<Vec<String>>,
}

/// `[tools]` section
#[derive(Debug, Default, Deserialize)]
pub struct ToolsFileConfig {
    /// Path to a TOML tool manifest
    pub manifest: Option<PathBuf>,
}

/// Load the TOML config file from the standard path
///
/// Returns `LiveConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> LiveConfigFile {
    config_file_path().map_or_else(LiveConfigFile::default, |path| load_config_from(&path))
}

/// Load a TOML config file, falling back to defaults on any failure
pub fn load_config_from(path: &Path) -> LiveConfigFile {
    if !path.exists() {
        return LiveConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                LiveConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            LiveConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/omni/beacon-live/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-live")
            .join("config.toml")
    })
}
