//! Configuration management for Beacon Live

pub mod file;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::TurnTiming;
use crate::live::{Modality, SETUP_TIMEOUT, SetupParams};
use crate::voice::{
    CaptureSource, DEFAULT_FLUSH_DELAY, DEFAULT_FRAME_BYTES, DEFAULT_MIN_FLUSH_BYTES, Renderer,
    capture_source_by_name, default_capture_sources, default_renderers, renderer_by_name,
};
use crate::{Error, Result};

use self::file::LiveConfigFile;

/// Default bidirectional endpoint
pub const DEFAULT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default live model
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Puck";

/// How the session talks to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Typed input, text responses
    Text,
    /// Microphone input, spoken responses
    #[default]
    Voice,
    /// Microphone and typed input, spoken responses
    Both,
}

impl Mode {
    /// Response modality requested at setup
    #[must_use]
    pub const fn modality(self) -> Modality {
        match self {
            Self::Text => Modality::Text,
            Self::Voice | Self::Both => Modality::Audio,
        }
    }

    /// Whether the microphone is captured
    #[must_use]
    pub const fn listens(self) -> bool {
        matches!(self, Self::Voice | Self::Both)
    }

    /// Whether stdin lines are sent as text turns
    #[must_use]
    pub const fn reads_input(self) -> bool {
        matches!(self, Self::Text | Self::Both)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "voice" | "audio" => Ok(Self::Voice),
            "both" => Ok(Self::Both),
            other => Err(format!("unknown mode '{other}' (expected text, voice or both)")),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Voice => "voice",
            Self::Both => "both",
        })
    }
}

/// Beacon Live configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection and model settings
    pub live: LiveConfig,

    /// Session mode
    pub mode: Mode,

    /// Buffering, timing and device settings
    pub audio: AudioConfig,

    /// Tool manifest to load, if any
    pub tools_manifest: Option<PathBuf>,
}

/// Connection and model settings
#[derive(Clone)]
pub struct LiveConfig {
    /// Bidirectional endpoint URL
    pub url: String,

    /// API key, appended as the `key` query parameter
    pub api_key: Option<String>,

    /// Model identifier
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// System instruction sent at setup
    pub system_instruction: Option<String>,

    /// Setup acknowledgment timeout
    pub setup_timeout: Duration,
}

impl fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("system_instruction", &self.system_instruction)
            .field("setup_timeout", &self.setup_timeout)
            .finish()
    }
}

/// Buffering, timing and device settings
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Output buffer flush threshold
    pub min_flush_bytes: usize,

    /// Output buffer debounce delay
    pub flush_delay: Duration,

    /// Microphone frame size
    pub frame_bytes: usize,

    /// Turn-taking timers
    pub timing: TurnTiming,

    /// Playback backends by name; empty means the platform default chain
    pub playback: Vec<String>,

    /// Capture sources by name; empty means the platform default chain
    pub capture: Vec<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            min_flush_bytes: DEFAULT_MIN_FLUSH_BYTES,
            flush_delay: DEFAULT_FLUSH_DELAY,
            frame_bytes: DEFAULT_FRAME_BYTES,
            timing: TurnTiming::default(),
            playback: Vec::new(),
            capture: Vec::new(),
        }
    }
}

impl AudioConfig {
    /// Playback backends in fallback order
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown backend name
    pub fn renderers(&self) -> Result<Vec<Arc<dyn Renderer>>> {
        if self.playback.is_empty() {
            return Ok(default_renderers());
        }
        self.playback
            .iter()
            .map(|name| {
                renderer_by_name(name)
                    .ok_or_else(|| Error::Config(format!("unknown playback backend: {name}")))
            })
            .collect()
    }

    /// Capture sources in fallback order
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unknown source name
    pub fn capture_sources(&self) -> Result<Vec<Arc<dyn CaptureSource>>> {
        if self.capture.is_empty() {
            return Ok(default_capture_sources());
        }
        self.capture
            .iter()
            .map(|name| {
                capture_source_by_name(name)
                    .ok_or_else(|| Error::Config(format!("unknown capture source: {name}")))
            })
            .collect()
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns error if a mode value cannot be parsed
    pub fn load() -> Result<Self> {
        // Load optional TOML config file (env > toml > default)
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Combine a parsed config file with variables from `env`
    ///
    /// # Errors
    ///
    /// Returns error if a mode value cannot be parsed
    pub fn resolve(fc: LiveConfigFile, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let millis =
            |value: Option<u64>, default: Duration| value.map_or(default, Duration::from_millis);

        let live = LiveConfig {
            url: fc.live.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            api_key: env("GEMINI_API_KEY")
                .or_else(|| env("GOOGLE_API_KEY"))
                .or(fc.live.api_key)
                .filter(|k| !k.is_empty()),
            model: env("BEACON_LIVE_MODEL")
                .or(fc.live.model)
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            voice: env("BEACON_LIVE_VOICE")
                .or(fc.live.voice)
                .unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            system_instruction: fc.live.system_instruction,
            setup_timeout: millis(fc.live.setup_timeout_ms, SETUP_TIMEOUT),
        };

        let mode = env("BEACON_LIVE_MODE")
            .or(fc.live.mode)
            .map(|m| m.parse::<Mode>().map_err(Error::Config))
            .transpose()?
            .unwrap_or_default();

        let defaults = AudioConfig::default();
        let audio = AudioConfig {
            min_flush_bytes: fc.audio.min_flush_bytes.unwrap_or(defaults.min_flush_bytes),
            flush_delay: millis(fc.audio.flush_delay_ms, defaults.flush_delay),
            frame_bytes: fc.audio.frame_bytes.unwrap_or(defaults.frame_bytes),
            timing: TurnTiming {
                settle_delay: millis(fc.audio.settle_delay_ms, defaults.timing.settle_delay),
                failsafe_resume: millis(
                    fc.audio.failsafe_resume_ms,
                    defaults.timing.failsafe_resume,
                ),
            },
            playback: fc.audio.playback.unwrap_or_default(),
            capture: fc.audio.capture.unwrap_or_default(),
        };

        let tools_manifest = env("BEACON_LIVE_TOOLS")
            .map(PathBuf::from)
            .or(fc.tools.manifest);

        Ok(Self {
            live,
            mode,
            audio,
            tools_manifest,
        })
    }

    /// Setup handshake parameters for this configuration (tools are added at
    /// connect time)
    #[must_use]
    pub fn setup_params(&self) -> SetupParams {
        SetupParams {
            model: self.live.model.clone(),
            voice: self.live.voice.clone(),
            system_instruction: self.live.system_instruction.clone(),
            tools: Vec::new(),
            modality: self.mode.modality(),
        }
    }
}
